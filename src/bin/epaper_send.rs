use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use epaper_link::raster::{ConvertOptions, load_and_convert};
use epaper_link::log::Logger;

/// Convert an image to 1-bit monochrome and push it through the e-paper
/// TX device.
#[derive(Parser, Debug)]
#[command(name = "epaper_send", disable_help_flag = true)]
struct Args {
    /// Device path
    #[arg(short = 'd', long = "device", default_value = "/dev/epaper_tx")]
    device: PathBuf,

    /// Target width in pixels
    #[arg(short = 'w', long = "width")]
    width: Option<u32>,

    /// Target height in pixels
    #[arg(short = 'h', long = "height")]
    height: Option<u32>,

    /// Black/white threshold (0-255)
    #[arg(short = 't', long = "threshold", default_value_t = 128)]
    threshold: u8,

    /// Use Floyd-Steinberg dithering
    #[arg(short = 'D', long = "dither")]
    dither: bool,

    /// Invert colors
    #[arg(short = 'i', long = "invert")]
    invert: bool,

    /// Show this help
    #[arg(long = "help", action = ArgAction::HelpLong)]
    help: Option<bool>,

    /// Image file to send
    image: PathBuf,
}

fn main() {
    let args = Args::parse();
    let _logger = Logger::new("info");

    match run(&args) {
        Ok(()) => {
            println!("Image sent successfully!");
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let options = ConvertOptions {
        target_width: args.width,
        target_height: args.height,
        dither: args.dither,
        invert: args.invert,
        threshold: args.threshold,
    };
    let mono = load_and_convert(&args.image, &options)
        .with_context(|| format!("cannot prepare {}", args.image.display()))?;
    let payload = mono.to_payload();

    println!(
        "Sending image: {}x{}, {} bytes data",
        mono.width,
        mono.height,
        mono.bits.len()
    );
    println!("Total transmission: {} bytes (header + data)", payload.len());

    let mut device = OpenOptions::new()
        .write(true)
        .open(&args.device)
        .with_context(|| format!("failed to open device {}", args.device.display()))?;

    send_with_progress(&mut device, &payload)
}

fn send_with_progress(device: &mut File, data: &[u8]) -> Result<()> {
    const CHUNK: usize = 1024;

    let mut sent = 0usize;
    while sent < data.len() {
        let end = (sent + CHUNK).min(data.len());
        let slice = &data[sent..end];
        match device.write(slice) {
            Ok(n) if n == slice.len() => sent += n,
            Ok(n) => {
                bail!(
                    "partial write at byte {}/{} ({}/{} bytes written)",
                    sent,
                    data.len(),
                    n,
                    slice.len()
                );
            }
            Err(e) => return Err(describe_device_error(e, sent, data.len())),
        }

        let progress = sent * 100 / data.len();
        print!("\rProgress: {}% ({}/{} bytes)", progress, sent, data.len());
        io::stdout().flush().ok();
    }
    println!();
    Ok(())
}

fn describe_device_error(e: io::Error, sent: usize, total: usize) -> anyhow::Error {
    let what = match e.raw_os_error() {
        Some(libc::ETIMEDOUT) => "connection timeout",
        Some(libc::ECOMM) => "communication error (NACK)",
        Some(libc::EHOSTUNREACH) => "receiver not reachable",
        Some(libc::ECONNREFUSED) => "connection refused",
        Some(libc::ECONNRESET) => "connection reset by receiver",
        _ => {
            return anyhow::Error::from(e)
                .context(format!("write failed at byte {}/{}", sent, total));
        }
    };
    anyhow::anyhow!("{} at byte {}/{}", what, sent, total)
}
