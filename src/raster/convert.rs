use std::path::Path;
use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, GrayImage};
use tracing::info;
use super::{ImageError, MAX_DIMENSION, MonoImage};

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub dither: bool,
    pub invert: bool,
    pub threshold: u8,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            target_width: None,
            target_height: None,
            dither: false,
            invert: false,
            threshold: 128,
        }
    }
}

pub fn load_and_convert(path: &Path, options: &ConvertOptions) -> Result<MonoImage, ImageError> {
    let decoded = image::open(path)?;
    info!(
        "image loaded: {}x{} from {}",
        decoded.width(),
        decoded.height(),
        path.display()
    );
    convert(&decoded, options)
}

pub fn convert(decoded: &DynamicImage, options: &ConvertOptions) -> Result<MonoImage, ImageError> {
    let gray = decoded.to_luma8();
    let (src_w, src_h) = (gray.width(), gray.height());
    if src_w == 0 || src_h == 0 {
        return Err(ImageError::InvalidDimensions {
            width: src_w,
            height: src_h,
        });
    }

    // resize only when both target dimensions are requested
    let (gray, width, height) = match (options.target_width, options.target_height) {
        (Some(w), Some(h)) if (w, h) != (src_w, src_h) => {
            if !(1..=MAX_DIMENSION).contains(&w) || !(1..=MAX_DIMENSION).contains(&h) {
                return Err(ImageError::InvalidDimensions {
                    width: w,
                    height: h,
                });
            }
            let resized = resize_nearest(&gray, w, h)?;
            info!("resized to {}x{}", w, h);
            (resized, w, h)
        }
        _ => (gray, src_w, src_h),
    };

    let pixels = width as usize * height as usize;
    info!(
        "converting to 1-bit monochrome ({} bytes)",
        pixels.div_ceil(8)
    );

    let bits = if options.dither {
        dither_pack(gray.as_raw(), width as usize, height as usize, options.invert)
    } else {
        threshold_pack(gray.as_raw(), options.invert, options.threshold)
    };

    Ok(MonoImage {
        width,
        height,
        bits,
    })
}

fn resize_nearest(gray: &GrayImage, width: u32, height: u32) -> Result<GrayImage, ImageError> {
    let src = FirImage::from_vec_u8(
        gray.width(),
        gray.height(),
        gray.as_raw().clone(),
        PixelType::U8,
    )
    .map_err(|e| ImageError::Resize(e.to_string()))?;
    let mut dst = FirImage::new(width, height, PixelType::U8);
    let mut resizer = Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &ResizeOptions::new().resize_alg(ResizeAlg::Nearest),
        )
        .map_err(|e| ImageError::Resize(e.to_string()))?;
    GrayImage::from_raw(width, height, dst.buffer().to_vec())
        .ok_or_else(|| ImageError::Resize("resized buffer has wrong length".to_string()))
}

fn set_black(bits: &mut [u8], index: usize) {
    bits[index / 8] |= 1 << (7 - index % 8);
}

fn threshold_pack(raw: &[u8], invert: bool, threshold: u8) -> Vec<u8> {
    let mut bits = vec![0u8; raw.len().div_ceil(8)];
    for (index, &pixel) in raw.iter().enumerate() {
        let value = if invert { 255 - pixel } else { pixel };
        if value < threshold {
            set_black(&mut bits, index);
        }
    }
    bits
}

/*
  Floyd-Steinberg error diffusion over a float copy of the plane:

          *   7/16
    3/16 5/16 1/16
 */
fn dither_pack(raw: &[u8], width: usize, height: usize, invert: bool) -> Vec<u8> {
    let mut gray: Vec<f32> = raw
        .iter()
        .map(|&p| {
            let value = p as f32;
            if invert { 255.0 - value } else { value }
        })
        .collect();

    for y in 0..height {
        for x in 0..width {
            let index = y * width + x;
            let old = gray[index];
            let new = if old > 127.5 { 255.0 } else { 0.0 };
            gray[index] = new;
            let error = old - new;

            if x + 1 < width {
                gray[index + 1] += error * 7.0 / 16.0;
            }
            if y + 1 < height {
                if x > 0 {
                    gray[index + width - 1] += error * 3.0 / 16.0;
                }
                gray[index + width] += error * 5.0 / 16.0;
                if x + 1 < width {
                    gray[index + width + 1] += error * 1.0 / 16.0;
                }
            }
        }
    }

    let mut bits = vec![0u8; (width * height).div_ceil(8)];
    for (index, &value) in gray.iter().enumerate() {
        if value < 127.5 {
            set_black(&mut bits, index);
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gray_image(pixels: &[u8], width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels.to_vec()).unwrap())
    }

    #[test]
    fn threshold_packs_msb_first() {
        // dark pixel at (0,0), light elsewhere
        let img = gray_image(&[0, 200, 200, 200, 200, 200, 200, 200], 8, 1);
        let mono = convert(&img, &ConvertOptions::default()).unwrap();
        assert_eq!(mono.bits, vec![0x80]);
    }

    #[test]
    fn invert_flips_the_verdict() {
        let img = gray_image(&[0, 200, 200, 200, 200, 200, 200, 200], 8, 1);
        let options = ConvertOptions {
            invert: true,
            ..Default::default()
        };
        let mono = convert(&img, &options).unwrap();
        assert_eq!(mono.bits, vec![0x7F]);
    }

    #[test]
    fn custom_threshold_moves_the_cut() {
        let img = gray_image(&[100, 100, 100, 100], 4, 1);
        let low = ConvertOptions {
            threshold: 50,
            ..Default::default()
        };
        let high = ConvertOptions {
            threshold: 200,
            ..Default::default()
        };
        assert_eq!(convert(&img, &low).unwrap().bits, vec![0x00]);
        assert_eq!(convert(&img, &high).unwrap().bits, vec![0xF0]);
    }

    #[test]
    fn resize_changes_geometry() {
        let mut src = GrayImage::new(4, 4);
        for (x, _, p) in src.enumerate_pixels_mut() {
            *p = Luma([if x < 2 { 0 } else { 255 }]);
        }
        let options = ConvertOptions {
            target_width: Some(2),
            target_height: Some(2),
            ..Default::default()
        };
        let mono = convert(&DynamicImage::ImageLuma8(src), &options).unwrap();
        assert_eq!((mono.width, mono.height), (2, 2));
        assert_eq!(mono.bits.len(), 1);
        // left column black, right column white, two rows: 10 10 -> 0xA0
        assert_eq!(mono.bits, vec![0xA0]);
    }

    #[test]
    fn resize_rejects_absurd_targets() {
        let img = gray_image(&[128; 4], 2, 2);
        let options = ConvertOptions {
            target_width: Some(MAX_DIMENSION + 1),
            target_height: Some(10),
            ..Default::default()
        };
        assert!(convert(&img, &options).is_err());
    }

    #[test]
    fn dithering_spreads_mid_gray() {
        let img = gray_image(&[128; 256], 16, 16);
        let options = ConvertOptions {
            dither: true,
            ..Default::default()
        };
        let mono = convert(&img, &options).unwrap();
        let black: u32 = mono.bits.iter().map(|b| b.count_ones()).sum();
        // roughly half the plane lands black
        assert!((90..=166).contains(&black), "black pixels: {}", black);
    }

    #[test]
    fn bitmap_sizes_for_known_planes() {
        let img = gray_image(&[255; 4096], 64, 64);
        let mono = convert(&img, &ConvertOptions::default()).unwrap();
        assert_eq!(mono.bits.len(), 512);
        assert_eq!(mono.to_payload().len(), 520);
    }
}
