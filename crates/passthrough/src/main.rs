//! usb-passthrough
//!
//! Operator tool for the passthrough core: lists the host devices that may be
//! handed to a guest and probes one through the same asynchronous path a
//! guest request takes.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{ChannelKernel, ReplyBridge, create_reply_bridge, setup_logging};
use passthrough::PassthroughDevice;
use passthrough::config::{PassthroughConfig, parse_device_selector};
use passthrough::usb::{DeviceManager, RusbDevice, error_code, error_name};
use protocol::messages::{DIR_DEVICE2HOST, REC_DEVICE, REQUEST_GET_DESCRIPTOR, TYPE_STANDARD};
use protocol::types::{DESCRIPTOR_TYPE_DEVICE, DEVICE_DESCRIPTOR_SIZE};
use protocol::{CtrlMessage, RequestId};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-passthrough")]
#[command(
    author,
    version,
    about = "USB passthrough - hand host USB devices to a guest"
)]
#[command(long_about = "
Lists host USB devices eligible for passthrough and probes them through the
passthrough core.

EXAMPLES:
    # List devices allowed by the configured filters
    usb-passthrough list

    # Attach interface 0 and read the device descriptor
    usb-passthrough probe --device 0x057e:0x0337

    # Write the default configuration and exit
    usb-passthrough --save-config

CONFIGURATION:
    1. Path specified with --config
    2. ~/.config/usb-passthrough/passthrough.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices and their descriptor trees
    List,
    /// Attach to a device and read its device descriptor
    Probe {
        /// Device to probe (0xVID:0xPID)
        #[arg(short, long, value_name = "VID:PID")]
        device: String,

        /// Interface to attach
        #[arg(short, long, default_value_t = 0)]
        interface: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = PassthroughConfig::default();
        let path = PassthroughConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        PassthroughConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        PassthroughConfig::load_or_default(None)
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-passthrough v{}", env!("CARGO_PKG_VERSION"));

    let manager =
        DeviceManager::new(config.usb.filters.clone()).context("Failed to initialize libusb")?;

    match args.command.unwrap_or(Command::List) {
        Command::List => list_devices(&manager),
        Command::Probe { device, interface } => {
            let (vid, pid) = parse_device_selector(&device)?;
            probe_device(&manager, &config, vid, pid, interface).await
        }
    }
}

fn list_devices(manager: &DeviceManager) -> Result<()> {
    let entries = manager.devices().context("Failed to enumerate devices")?;
    if entries.is_empty() {
        println!("No USB devices found");
        return Ok(());
    }

    // Listing never touches guest memory
    let (_bridge, queue) = create_reply_bridge();
    let kernel = Arc::new(ChannelKernel::new(0, queue));

    for entry in entries {
        let device = PassthroughDevice::new(kernel.clone(), entry.device, entry.descriptor);
        let desc = device.device_descriptor();
        println!(
            "{} bus {:03} address {:03}  class {:#04x}  USB {:x}.{:02x}  id {:#018x}",
            device.identity(),
            entry.bus_number,
            entry.address,
            desc.device_class,
            desc.bcd_usb >> 8,
            desc.bcd_usb & 0xff,
            device.id()
        );

        for (config_index, config) in device.indexed_configurations() {
            println!(
                "  config {} (value {}, {} interfaces, {} mA)",
                config_index,
                config.configuration_value,
                config.num_interfaces,
                u16::from(config.max_power) * 2
            );
            for interface in device.interfaces(config_index) {
                println!(
                    "    interface {} alt {}  class {:#04x}",
                    interface.interface_number,
                    interface.alternate_setting,
                    interface.interface_class
                );
                let endpoints = device.endpoints(
                    config_index,
                    interface.interface_number,
                    interface.alternate_setting,
                );
                for endpoint in endpoints {
                    println!(
                        "      endpoint {:#04x} {} type {} max packet {}",
                        endpoint.endpoint_address,
                        if endpoint.is_in() { "IN " } else { "OUT" },
                        endpoint.transfer_type(),
                        endpoint.max_packet_size
                    );
                }
            }
        }
    }

    Ok(())
}

async fn probe_device(
    manager: &DeviceManager,
    config: &PassthroughConfig,
    vid: u16,
    pid: u16,
    interface: u8,
) -> Result<()> {
    let entry = manager
        .find(vid, pid)
        .context("Failed to enumerate devices")?
        .ok_or_else(|| anyhow!("Device {:04x}:{:04x} not found", vid, pid))?;

    let (bridge, queue) = create_reply_bridge();
    let kernel = Arc::new(ChannelKernel::new(config.guest.memory_size, queue));
    let mut device: PassthroughDevice<RusbDevice> =
        PassthroughDevice::new(kernel.clone(), entry.device, entry.descriptor);

    device
        .attach(interface)
        .map_err(|e| anyhow!("Failed to attach interface {}: {}", interface, e))?;
    println!(
        "{} attached interface {} ({} alternate settings)",
        device.identity(),
        interface,
        device.number_of_alt_settings(interface)
    );

    let request = CtrlMessage {
        id: RequestId(1),
        request_type: DIR_DEVICE2HOST | TYPE_STANDARD | REC_DEVICE,
        request: REQUEST_GET_DESCRIPTOR,
        value: u16::from(DESCRIPTOR_TYPE_DEVICE) << 8,
        index: 0,
        length: u16::from(DEVICE_DESCRIPTOR_SIZE),
        data_address: 0,
    };
    if let Err(e) = device.submit_control(request) {
        let code = error_code(e);
        error!("Submission failed: {} ({})", error_name(code), code);
        return Err(anyhow!("Failed to submit GET_DESCRIPTOR: {}", e));
    }

    let result = await_reply(&bridge, config).await?;
    println!("GET_DESCRIPTOR(Device) -> {}", result);
    if result > 0 {
        let data = kernel.dump(0, usize::from(DEVICE_DESCRIPTOR_SIZE));
        let hex: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {}", hex.join(" "));
    }

    Ok(())
}

async fn await_reply(bridge: &ReplyBridge, config: &PassthroughConfig) -> Result<i32> {
    let timeout = config.guest.reply_timeout();
    let reply = tokio::time::timeout(timeout, bridge.recv_reply())
        .await
        .map_err(|_| anyhow!("No reply within {:?}", timeout))?
        .context("Reply channel closed")?;
    Ok(reply.result)
}
