use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::info;
use super::MonoImage;

/// Binary PBM (`P4`): magic, comment, dimensions, then the bitmap rows
/// verbatim; the wire bitmap is already in PBM bit order.
pub fn write_pbm(path: &Path, image: &MonoImage) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(b"P4\n")?;
    writeln!(out, "# received over epaper link")?;
    writeln!(out, "{} {}", image.width, image.height)?;
    out.write_all(&image.bits)?;
    out.flush()?;
    info!("PBM image saved to {}", path.display());
    Ok(())
}

/// Raw dump in the wire schema: big-endian dimensions then the bitmap.
pub fn write_raw(path: &Path, image: &MonoImage) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&image.width.to_be_bytes())?;
    out.write_all(&image.height.to_be_bytes())?;
    out.write_all(&image.bits)?;
    out.flush()?;
    info!("raw image saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("epaper_{}_{}", tag, std::process::id()))
    }

    fn sample() -> MonoImage {
        MonoImage {
            width: 10,
            height: 2,
            bits: vec![0xFF, 0xC0, 0x00, 0x30],
        }
    }

    #[test]
    fn pbm_layout() {
        let path = temp_path("out.pbm");
        let image = sample();
        write_pbm(&path, &image).unwrap();

        let written = std::fs::read(&path).unwrap();
        assert!(written.starts_with(b"P4\n"));
        let header_end = written.len() - image.bits.len();
        let header = std::str::from_utf8(&written[..header_end]).unwrap();
        assert!(header.ends_with("10 2\n"));
        assert_eq!(&written[header_end..], &image.bits[..]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn raw_layout() {
        let path = temp_path("out.raw");
        let image = sample();
        write_raw(&path, &image).unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[0..4], &10u32.to_be_bytes());
        assert_eq!(&written[4..8], &2u32.to_be_bytes());
        assert_eq!(&written[8..], &image.bits[..]);
        std::fs::remove_file(&path).ok();
    }
}
