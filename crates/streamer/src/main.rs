//! usb-streamer
//!
//! Opens a USB device by bus and address, claims one interface and streams
//! interrupt reports from an IN endpoint, printing each one as hex. All USB
//! I/O is asynchronous and driven from a single-threaded main loop.

mod config;
mod device;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use common::{CompletionStatus, setup_logging};
use config::StreamerConfig;
use engine::{Interface, Libusb, MainLoop, UsbSource};
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to keep handling events after the interface closed, so
/// cancelled transfers are reported back and freed
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "usb-streamer")]
#[command(author, version, about = "Stream interrupt reports from a USB device")]
#[command(long_about = "
Streams interrupt IN reports from a USB device and prints them as hex.

EXAMPLES:
    # List USB devices
    usb-streamer --list-devices

    # Stream 32-byte reports from endpoint 1 of device 003:007
    usb-streamer --bus 3 --address 7

    # Send an init packet to OUT endpoint 2 first, stop after 100 reports
    usb-streamer --bus 3 --address 7 --write-endpoint 2 --write \"01 03 02\" --count 100

CONFIGURATION:
    The streamer looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-streamer/streamer.toml
    3. /etc/usb-streamer/streamer.toml
    4. Built-in defaults
    Command line options override the configuration file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Bus number of the device
    #[arg(short, long)]
    bus: Option<u8>,

    /// Address of the device on its bus
    #[arg(short, long)]
    address: Option<u8>,

    /// Interface to claim
    #[arg(short, long)]
    interface: Option<u8>,

    /// Do not detach a kernel driver holding the interface
    #[arg(long)]
    no_detach: bool,

    /// IN endpoint number to read from
    #[arg(short, long)]
    endpoint: Option<u8>,

    /// Bytes requested per report
    #[arg(long, value_name = "BYTES")]
    length: Option<usize>,

    /// Stop after this many reports
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// OUT endpoint number for --write
    #[arg(long, requires = "write")]
    write_endpoint: Option<u8>,

    /// Hex bytes to write once at startup
    #[arg(long, value_name = "HEX", requires = "write_endpoint")]
    write: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Fold command line overrides into `config`.
    fn apply(&self, config: &mut StreamerConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.bus.is_some() {
            config.device.bus = self.bus;
        }
        if self.address.is_some() {
            config.device.address = self.address;
        }
        if let Some(interface) = self.interface {
            config.device.interface = interface;
        }
        if self.no_detach {
            config.device.detach_kernel_driver = false;
        }
        if let Some(endpoint) = self.endpoint {
            config.stream.endpoint = endpoint;
        }
        if let Some(length) = self.length {
            config.stream.report_length = length;
        }
        if self.count.is_some() {
            config.stream.max_reports = self.count;
        }
        if let (Some(endpoint), Some(data)) = (self.write_endpoint, &self.write) {
            config.stream.startup_write = Some(config::StartupWrite {
                endpoint,
                data: data.clone(),
            });
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = StreamerConfig::default();
        let path = StreamerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        StreamerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        StreamerConfig::load_or_default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.logging.level).context("Failed to setup logging")?;

    info!("usb-streamer v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", config.logging.level);

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context);
    }

    stream(context, &config)
}

/// List USB devices and exit
fn list_devices_mode(context: &rusb::Context) -> Result<()> {
    let devices = device::list_devices(context)?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!(
                "  Bus {:03} Device {:03}: {:04x}:{:04x} - {} {}",
                device.bus_number,
                device.address,
                device.vendor_id,
                device.product_id,
                device
                    .manufacturer
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                device.product.as_deref().unwrap_or("Unknown Product")
            );
        }
    }

    Ok(())
}

/// Stream reports until `max_reports` is reached or a signal arrives
fn stream(context: rusb::Context, config: &StreamerConfig) -> Result<()> {
    let (Some(bus), Some(address)) = (config.device.bus, config.device.address) else {
        return Err(anyhow!(
            "No device selected, pass --bus and --address (see --list-devices)"
        ));
    };

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, stop.clone())
            .context("Failed to register signal handler")?;
    }

    let handle = Rc::new(device::open_device(&context, bus, address)?);
    let library = Rc::new(Libusb::new(context));

    let main_loop = MainLoop::new();
    let source = UsbSource::new(library.clone());
    source
        .attach(&main_loop)
        .context("Failed to attach USB event source")?;

    let interface = Interface::open(
        library.clone(),
        handle,
        config.device.interface,
        config.device.detach_kernel_driver,
    )
    .with_context(|| format!("Failed to open interface {}", config.device.interface))?;
    info!(
        "Streaming from device {:03}:{:03} interface {}",
        bus,
        address,
        interface.number()
    );

    if let Some(write) = &config.stream.startup_write {
        let data = write.bytes()?;
        interface
            .submit_write(write.endpoint, &data, |done| {
                if done.status().is_success() {
                    info!("Startup write of {} bytes on {}", done.actual_length(), done.endpoint());
                } else {
                    warn!("Startup write on {} failed: {:?}", done.endpoint(), done.status());
                }
                false
            })
            .context("Failed to submit startup write")?;
    }

    let progress = Rc::new(Progress::new(config.stream.max_reports));
    {
        let progress = progress.clone();
        interface
            .submit_read(config.stream.endpoint, config.stream.report_length, move |done| {
                if !progress.record(done.status()) {
                    warn!("Read on {} ended: {:?}", done.endpoint(), done.status());
                    return false;
                }
                println!("{}", format_hex(done.data()));
                !progress.finished()
            })
            .context("Failed to start streaming")?;
    }

    let result = main_loop.run_until(|| stop.load(Ordering::Relaxed) || progress.finished());
    if stop.load(Ordering::Relaxed) {
        info!("Received signal, shutting down...");
    }
    if let Err(e) = &result {
        error!("Event loop failed: {}", e);
    }

    drop(interface);
    if let Err(e) = rusb::UsbContext::handle_events(library.context(), Some(SHUTDOWN_DRAIN)) {
        warn!("Failed to drain cancelled transfers: {}", e);
    }
    info!("Received {} report(s)", progress.reports());

    result.context("USB streaming failed")
}

/// Report count and stop condition for the read stream
struct Progress {
    reports: Cell<u64>,
    max_reports: Option<u64>,
    finished: Cell<bool>,
}

impl Progress {
    fn new(max_reports: Option<u64>) -> Self {
        Self {
            reports: Cell::new(0),
            max_reports,
            finished: Cell::new(false),
        }
    }

    /// Count one completion. Returns `false` for a failed completion, which
    /// ends the stream without counting as a report.
    fn record(&self, status: CompletionStatus) -> bool {
        if !status.is_success() {
            self.finished.set(true);
            return false;
        }

        self.reports.set(self.reports.get() + 1);
        if self.max_reports.is_some_and(|max| self.reports.get() >= max) {
            self.finished.set(true);
        }
        true
    }

    fn reports(&self) -> u64 {
        self.reports.get()
    }

    fn finished(&self) -> bool {
        self.finished.get()
    }
}

fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
