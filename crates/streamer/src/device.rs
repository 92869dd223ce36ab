//! USB device lookup

use anyhow::{Context as _, Result, anyhow};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// Summary of one attached device, as printed by `--list-devices`
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Find the device at `bus`/`address`
pub fn find_device(context: &Context, bus: u8, address: u8) -> Result<Device<Context>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    devices
        .iter()
        .find(|device| device.bus_number() == bus && device.address() == address)
        .ok_or_else(|| anyhow!("No USB device at bus {:03} address {:03}", bus, address))
}

/// Open the device at `bus`/`address`
pub fn open_device(context: &Context, bus: u8, address: u8) -> Result<DeviceHandle<Context>> {
    let device = find_device(context, bus, address)?;
    let handle = device
        .open()
        .with_context(|| format!("Failed to open device {:03}:{:03}", bus, address))?;
    debug!("Opened device {:03}:{:03}", bus, address);
    Ok(handle)
}

/// Enumerate attached devices, skipping any whose descriptor cannot be read
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    let mut summaries = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(
                    "Failed to read descriptor of device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        let (manufacturer, product) = match device.open() {
            Ok(handle) => (
                handle.read_manufacturer_string_ascii(&descriptor).ok(),
                handle.read_product_string_ascii(&descriptor).ok(),
            ),
            Err(_) => (None, None),
        };

        summaries.push(DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer,
            product,
        });
    }

    Ok(summaries)
}
