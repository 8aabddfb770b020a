use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use epaper_link::raster::{ImageHeader, MonoImage, write_pbm, write_raw};
use epaper_link::log::Logger;

/// Receive a 1-bit image from the e-paper RX device and store it.
#[derive(Parser, Debug)]
#[command(name = "epaper_receive")]
struct Args {
    /// Device path
    #[arg(short = 'd', long = "device", default_value = "/dev/epaper_rx")]
    device: PathBuf,

    /// Output file
    #[arg(short = 'o', long = "output", default_value = "received_image.pbm")]
    output: PathBuf,

    /// Output format
    #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Pbm)]
    format: OutputFormat,

    /// Timeout per wait in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 30_000)]
    timeout_ms: i32,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Raw,
    Pbm,
}

fn main() {
    let args = Args::parse();
    let _logger = Logger::new(if args.verbose { "debug" } else { "info" });

    match run(&args) {
        Ok(()) => {
            println!("Image received successfully!");
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let device = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&args.device)
        .with_context(|| format!("failed to open device {}", args.device.display()))?;

    if args.verbose {
        println!("Waiting for image dimensions...");
    }
    let mut header_bytes = [0u8; ImageHeader::LEN];
    read_exact(&device, &mut header_bytes, args.timeout_ms, false)
        .context("failed to read image dimensions")?;
    let header = ImageHeader::parse(&header_bytes)?;

    if args.verbose {
        println!(
            "Receiving image: {}x{} ({} bytes)",
            header.width,
            header.height,
            header.bitmap_len()
        );
    }

    let mut bits = vec![0u8; header.bitmap_len()];
    read_exact(&device, &mut bits, args.timeout_ms, args.verbose)
        .context("failed to read image data")?;
    if args.verbose {
        println!();
    }

    let image = MonoImage {
        width: header.width,
        height: header.height,
        bits,
    };
    match args.format {
        OutputFormat::Pbm => write_pbm(&args.output, &image)?,
        OutputFormat::Raw => write_raw(&args.output, &image)?,
    }
    Ok(())
}

fn wait_for_data(device: &File, timeout_ms: i32) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd: device.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("poll failed");
    }
    if ret == 0 {
        bail!("timeout waiting for data");
    }
    if pfd.revents & libc::POLLIN == 0 {
        bail!("device reported no data");
    }
    Ok(())
}

fn read_exact(mut device: &File, buf: &mut [u8], timeout_ms: i32, progress: bool) -> Result<()> {
    let total = buf.len();
    let mut done = 0usize;
    while done < total {
        wait_for_data(device, timeout_ms)?;
        match device.read(&mut buf[done..]) {
            Ok(0) => bail!("unexpected end of stream at byte {}/{}", done, total),
            Ok(n) => {
                done += n;
                if progress {
                    print!("\rProgress: {}% ({}/{} bytes)", done * 100 / total, done, total);
                    io::stdout().flush().ok();
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => return Err(e).context("read failed"),
        }
    }
    Ok(())
}
