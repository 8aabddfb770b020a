mod convert;
mod output;

pub use convert::{ConvertOptions, convert, load_and_convert};
pub use output::{write_pbm, write_raw};

use thiserror::Error;

// Receiver-enforced bound on either image dimension
pub const MAX_DIMENSION : u32 = 10_000;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to load image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("resize failed: {0}")]
    Resize(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/*
  Payload schema at the head of a session stream:

    width:  u32 big-endian
    height: u32 big-endian
    bitmap: ceil(width*height/8) bytes, MSB-first, 1 = black

  The link below carries this as opaque bytes; only the programs at the
  two ends interpret it.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
}

impl ImageHeader {
    pub const LEN: usize = 8;

    pub fn new(width: u32, height: u32) -> Result<ImageHeader, ImageError> {
        if !(1..=MAX_DIMENSION).contains(&width) || !(1..=MAX_DIMENSION).contains(&height) {
            return Err(ImageError::InvalidDimensions { width, height });
        }
        Ok(ImageHeader { width, height })
    }

    pub fn parse(bytes: &[u8; Self::LEN]) -> Result<ImageHeader, ImageError> {
        let width = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let height = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        Self::new(width, height)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0..4].copy_from_slice(&self.width.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.height.to_be_bytes());
        bytes
    }

    pub fn bitmap_len(&self) -> usize {
        (self.width as usize * self.height as usize).div_ceil(8)
    }
}

/// A 1-bpp raster, MSB-first rows in reading order, 1 = black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonoImage {
    pub width: u32,
    pub height: u32,
    pub bits: Vec<u8>,
}

impl MonoImage {
    pub fn header(&self) -> ImageHeader {
        ImageHeader {
            width: self.width,
            height: self.height,
        }
    }

    /// Header followed by bitmap, ready for the TX device.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(ImageHeader::LEN + self.bits.len());
        payload.extend_from_slice(&self.header().to_bytes());
        payload.extend_from_slice(&self.bits);
        payload
    }
}
