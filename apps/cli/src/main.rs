use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info};
use zbota_core::backend::{Fetcher, HttpFetcher, OtaConfig, backend_for_manufacturer};
use zbota_core::image::Image;
use zbota_core::protocol::tags;
use zbota_core::{DeviceFirmwareIdentity, detect_format, find_image_start, verify_image_data};

#[derive(Parser, Debug)]
#[command(author, version, about = "Zigbee OTA firmware tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file (session timings and backend URLs)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse an OTA upgrade file and print its contents
    Inspect {
        /// Path to the .ota / .zigbee file
        file: PathBuf,
    },
    /// Ask a firmware backend whether a newer image exists
    Check(DeviceArgs),
    /// Download and validate the newest image for a device
    Fetch {
        #[command(flatten)]
        device: DeviceArgs,

        /// Where to write the validated image
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct DeviceArgs {
    /// Manufacturer name as reported by the device (selects the backend)
    #[arg(long)]
    manufacturer_name: String,

    /// Manufacturer code (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_u16)]
    manufacturer_code: u16,

    /// Image type (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_u16)]
    image_type: u16,

    /// Current file version (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_u32)]
    file_version: u32,

    /// Hardware version, required by some backends
    #[arg(long, value_parser = parse_u16)]
    hardware_version: Option<u16>,
}

impl DeviceArgs {
    fn identity(&self) -> DeviceFirmwareIdentity {
        let identity =
            DeviceFirmwareIdentity::new(self.manufacturer_code, self.image_type, self.file_version);
        match self.hardware_version {
            Some(hw) => identity.with_hardware_version(hw),
            None => identity,
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_u32(s)?;
    u16::try_from(value).map_err(|_| format!("'{}' does not fit in 16 bits", s))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => OtaConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OtaConfig::default(),
    };

    match args.command {
        Command::Inspect { file } => inspect(&file),
        Command::Check(device) => {
            let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
            let backend =
                backend_for_manufacturer(&device.manufacturer_name, fetcher, &config.backends);
            let identity = device.identity();
            info!(backend = backend.name(), identity = %identity, "Checking for updates");

            let ordering = backend.is_newer_available(&identity).await?;
            let available = ordering == std::cmp::Ordering::Less;
            if ordering == std::cmp::Ordering::Greater {
                println!("Device firmware is newer than the latest published image");
            }
            println!("Update available: {}", if available { "yes" } else { "no" });
            Ok(())
        }
        Command::Fetch { device, output } => {
            let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
            let backend =
                backend_for_manufacturer(&device.manufacturer_name, fetcher, &config.backends);
            let image = backend.fetch_image(&device.identity()).await?;
            std::fs::write(&output, image.raw())
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                path = %output.display(),
                file_version = %format!("0x{:08X}", image.header().file_version),
                size = image.raw().len(),
                "Image written"
            );
            print_image(&image);
            Ok(())
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let start = find_image_start(&data).unwrap_or(0);
    if start > 0 {
        println!("OTA header found at offset {}", start);
    }
    let image = Image::parse(&data[start..])?;
    print_image(&image);
    Ok(())
}

fn print_image(image: &Image) {
    let header = image.header();
    println!("Header version:       0x{:04X}", header.header_version);
    println!("Header length:        {}", header.header_length);
    println!("Field control:        0x{:04X}", header.field_control);
    println!("Manufacturer code:    0x{:04X}", header.manufacturer_code);
    println!("Image type:           0x{:04X}", header.image_type);
    println!("File version:         0x{:08X}", header.file_version);
    println!("Stack version:        0x{:04X}", header.stack_version);
    println!("Header string:        {}", header.header_string_lossy());
    println!("Total image size:     {}", header.total_image_size);
    if let Some(version) = header.security_credential_version {
        println!("Security credential:  {}", version);
    }
    if let Some(destination) = header.upgrade_file_destination {
        let hex: Vec<String> = destination.iter().map(|b| format!("{:02X}", b)).collect();
        println!("Destination:          {}", hex.join(":"));
    }
    if let (Some(min), Some(max)) = (header.hardware_version_min, header.hardware_version_max) {
        println!("Hardware versions:    {}..={}", min, max);
    }
    if !header.header_padding.is_empty() {
        println!("Header padding:       {} bytes", header.header_padding.len());
    }

    println!("Sub-elements:         {}", image.elements().len());
    for element in image.elements() {
        let name = match element.tag_id {
            tags::UPGRADE_IMAGE => "upgrade image",
            tags::ECDSA_SIGNATURE => "ECDSA signature",
            tags::ECDSA_SIGNING_CERTIFICATE => "ECDSA signing certificate",
            tags::IMAGE_INTEGRITY_CODE => "image integrity code",
            _ => "manufacturer specific",
        };
        let format = detect_format(&element.data)
            .map(|f| format!(", {}", f))
            .unwrap_or_default();
        println!(
            "  tag 0x{:04X} ({}): {} bytes{}",
            element.tag_id,
            name,
            element.length(),
            format
        );
    }
    match verify_image_data(image) {
        Ok(()) => println!("Firmware integrity:   ok"),
        Err(e) => println!("Firmware integrity:   {}", e),
    }
}
