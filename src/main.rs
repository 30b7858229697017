//! Astarte device - Main Entry Point
//!
//! Runs a device from a configuration file, or helps prepare one: device id
//! validation and generation, interface definition checks.

use astarte_device::config::DeviceConfig;
use astarte_device::device::{AggregateMessage, DeviceBuilder, IndividualMessage};
use astarte_device::error::DeviceError;
use astarte_device::interfaces::{validate_interface, Interface};
use astarte_device::observability::init_default_logging;
use astarte_device::protocol::{is_valid_device_id, namespaced_device_id, random_device_id};
use astarte_device::Device;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Device-side connectivity client for Astarte-style brokers
#[derive(Parser)]
#[command(name = "astarte-device")]
#[command(about = "Device-side connectivity client for Astarte-style MQTT brokers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured device and log incoming traffic
    Run {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Check whether a device id is valid
    ValidateId {
        /// Device id to check
        id: String,
    },
    /// Generate a device id
    GenerateId {
        /// Namespace UUID for a deterministic id
        #[arg(long, requires = "name")]
        namespace: Option<Uuid>,
        /// Payload hashed into the namespace (e.g. a serial number)
        #[arg(long, requires = "namespace")]
        name: Option<String>,
    },
    /// Parse and validate an interface definition
    CheckInterface {
        /// Interface JSON file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => {
            init_default_logging();
            info!("Starting astarte-device v{}", env!("CARGO_PKG_VERSION"));
            run_device(config).await
        }
        Commands::ValidateId { id } => {
            if is_valid_device_id(&id) {
                println!("{id} is a valid device id");
                Ok(())
            } else {
                eprintln!("{id} is not a valid device id");
                process::exit(1);
            }
        }
        Commands::GenerateId { namespace, name } => {
            let id = match (namespace, name) {
                (Some(namespace), Some(name)) => namespaced_device_id(&namespace, name.as_bytes()),
                _ => random_device_id(),
            };
            println!("{id}");
            Ok(())
        }
        Commands::CheckInterface { file } => check_interface(&file),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<PathBuf>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(&path)?);
    }

    for candidate in ["device.toml", "config/device.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
}

async fn run_device(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_configuration(config_path)?;
    let device = DeviceBuilder::from_config(&config)?.build()?;
    install_logging_handlers(&device);

    info!(
        device_id = %device.device_id(),
        realm = %device.realm(),
        interfaces = device.interfaces().len(),
        "Device ready, connecting"
    );

    if let Err(e) = device.connect_and_wait().await {
        error!("Failed to connect: {}", e);
        device.disconnect().await;
        return Err(DeviceError::from(e).into());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device is connected and waiting for data");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    device.disconnect().await;
    info!("Device shutdown complete");
    Ok(())
}

fn install_logging_handlers(device: &Device) {
    device.on_individual_message(|_device: &Device, message: IndividualMessage| {
        info!(
            interface = %message.interface,
            path = %message.path,
            bytes = message.payload.len(),
            "Received value"
        );
    });
    device.on_aggregate_message(|_device: &Device, message: AggregateMessage| {
        info!(
            interface = %message.interface,
            path = %message.path,
            bytes = message.payload.len(),
            "Received object"
        );
    });
    device.on_error(|_device: &Device, error: DeviceError| {
        warn!(error = %error.sanitized_message(), "Device error");
    });
    device.on_connection_state_changed(|device: &Device, connected: bool| {
        info!(device_id = %device.device_id(), connected, "Connectivity changed");
    });
}

fn check_interface(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let interface = Interface::from_file(path)?;
    validate_interface(&interface)?;

    println!(
        "{} v{}.{}: {} {}, {} aggregation, {} mappings",
        interface.name,
        interface.major_version,
        interface.minor_version,
        interface.ownership,
        interface.interface_type,
        interface.aggregation,
        interface.mappings.len()
    );
    Ok(())
}
