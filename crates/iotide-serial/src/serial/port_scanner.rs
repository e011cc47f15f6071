//! Serial port discovery.
//!
//! Enumerates ports through the active transport, detects USB-serial
//! adapters and development boards by VID/PID, ranks candidates for
//! auto-connect and persists the last device that connected.

use crate::serial::device_store::LastDeviceStore;
use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Known USB-serial adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known USB VID/PID pair for a serial adapter or board.
#[derive(Debug, Clone)]
pub struct KnownAdapter {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub chipset: &'static str,
}

/// Registry of USB-to-serial chipsets and boards that run a REPL.
pub fn known_adapters() -> Vec<KnownAdapter> {
    vec![
        // FTDI
        KnownAdapter { vid: 0x0403, pid: 0x6001, manufacturer: "FTDI", product: "FT232R", chipset: "FT232R" },
        KnownAdapter { vid: 0x0403, pid: 0x6010, manufacturer: "FTDI", product: "FT2232", chipset: "FT2232" },
        KnownAdapter { vid: 0x0403, pid: 0x6014, manufacturer: "FTDI", product: "FT232H", chipset: "FT232H" },
        KnownAdapter { vid: 0x0403, pid: 0x6015, manufacturer: "FTDI", product: "FT-X Series", chipset: "FT230X" },
        // Silicon Labs (CP210x), common on ESP32 dev boards
        KnownAdapter { vid: 0x10C4, pid: 0xEA60, manufacturer: "Silicon Labs", product: "CP2102", chipset: "CP2102" },
        KnownAdapter { vid: 0x10C4, pid: 0xEA61, manufacturer: "Silicon Labs", product: "CP2102N", chipset: "CP2102N" },
        KnownAdapter { vid: 0x10C4, pid: 0xEA70, manufacturer: "Silicon Labs", product: "CP2105", chipset: "CP2105" },
        // WCH (CH340 / CH9102), common on cheap ESP8266/ESP32 boards
        KnownAdapter { vid: 0x1A86, pid: 0x7523, manufacturer: "WCH", product: "CH340", chipset: "CH340" },
        KnownAdapter { vid: 0x1A86, pid: 0x7522, manufacturer: "WCH", product: "CH340K", chipset: "CH340K" },
        KnownAdapter { vid: 0x1A86, pid: 0x55D4, manufacturer: "WCH", product: "CH9102", chipset: "CH9102" },
        // Prolific
        KnownAdapter { vid: 0x067B, pid: 0x2303, manufacturer: "Prolific", product: "PL2303", chipset: "PL2303" },
        // Espressif native USB
        KnownAdapter { vid: 0x303A, pid: 0x1001, manufacturer: "Espressif", product: "ESP32-S3", chipset: "USB-JTAG/serial" },
        KnownAdapter { vid: 0x303A, pid: 0x0002, manufacturer: "Espressif", product: "ESP32-S2", chipset: "USB CDC" },
        KnownAdapter { vid: 0x303A, pid: 0x4001, manufacturer: "Espressif", product: "ESP32-S3 MicroPython", chipset: "USB CDC" },
        // Arduino
        KnownAdapter { vid: 0x2341, pid: 0x0043, manufacturer: "Arduino", product: "Uno R3", chipset: "ATmega16U2" },
        KnownAdapter { vid: 0x2341, pid: 0x0042, manufacturer: "Arduino", product: "Mega 2560 R3", chipset: "ATmega16U2" },
        KnownAdapter { vid: 0x2341, pid: 0x8036, manufacturer: "Arduino", product: "Leonardo", chipset: "Native USB" },
        KnownAdapter { vid: 0x2341, pid: 0x025E, manufacturer: "Arduino", product: "Nano RP2040 Connect", chipset: "RP2040 CDC" },
        // Adafruit (CircuitPython boards)
        KnownAdapter { vid: 0x239A, pid: 0x80F4, manufacturer: "Adafruit", product: "Feather RP2040", chipset: "RP2040 CDC" },
        KnownAdapter { vid: 0x239A, pid: 0x8029, manufacturer: "Adafruit", product: "Feather M0", chipset: "SAMD21 CDC" },
        // Raspberry Pi
        KnownAdapter { vid: 0x2E8A, pid: 0x0005, manufacturer: "Raspberry Pi", product: "Pico (MicroPython)", chipset: "RP2040 CDC" },
        KnownAdapter { vid: 0x2E8A, pid: 0x000A, manufacturer: "Raspberry Pi", product: "Pico", chipset: "RP2040 CDC" },
        // STMicroelectronics
        KnownAdapter { vid: 0x0483, pid: 0x5740, manufacturer: "STMicroelectronics", product: "STM32 VCP", chipset: "STM32 CDC" },
    ]
}

/// Look up a known adapter by VID/PID.
pub fn lookup_adapter(vid: u16, pid: u16) -> Option<KnownAdapter> {
    known_adapters()
        .into_iter()
        .find(|a| a.vid == vid && a.pid == pid)
}

/// Vendor names that mark a port as a likely development board.
pub const KNOWN_VENDOR_TOKENS: [&str; 4] = ["esp", "arduino", "ftdi", "silicon labs"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classify a port name into a PortType.
pub fn classify_port(port_name: &str) -> PortType {
    let lower = port_name.to_lowercase();
    if lower.contains("usb") || lower.contains("acm") || lower.contains("usbmodem") || lower.contains("usbserial") {
        PortType::UsbSerial
    } else if lower.contains("bluetooth") || lower.contains("rfcomm") {
        PortType::Bluetooth
    } else if lower.contains("pts") || lower.contains("pty") {
        PortType::Virtual
    } else if lower.starts_with("com") || lower.starts_with("/dev/ttys") {
        PortType::Native
    } else {
        PortType::Unknown
    }
}

/// Generate a display name for a discovered port.
pub fn generate_display_name(port: &PortDescriptor) -> String {
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        if let Some(adapter) = lookup_adapter(vid, pid) {
            return format!("{} - {} {}", port.path, adapter.manufacturer, adapter.product);
        }
    }
    match (&port.manufacturer, &port.product) {
        (Some(m), Some(p)) if !p.is_empty() => format!("{} - {} {}", port.path, m, p),
        (None, Some(p)) if !p.is_empty() => format!("{} - {}", port.path, p),
        (Some(m), _) if !m.is_empty() => format!("{} - {}", port.path, m),
        _ => port.path.clone(),
    }
}

/// Create a `PortDescriptor` from enumeration data.
///
/// A missing manufacturer or product is filled from the known-adapter
/// table when the VID/PID matches.
pub fn build_port_descriptor(
    path: &str,
    vid: Option<u16>,
    pid: Option<u16>,
    manufacturer: Option<&str>,
    product: Option<&str>,
    serial_number: Option<&str>,
) -> PortDescriptor {
    let port_type = if vid.is_some() {
        PortType::UsbSerial
    } else {
        classify_port(path)
    };
    let adapter = match (vid, pid) {
        (Some(v), Some(p)) => lookup_adapter(v, p),
        _ => None,
    };
    let non_empty = |s: Option<&str>| s.filter(|s| !s.trim().is_empty()).map(str::to_string);

    let mut port = PortDescriptor {
        path: path.to_string(),
        port_type,
        manufacturer: non_empty(manufacturer)
            .or_else(|| adapter.as_ref().map(|a| a.manufacturer.to_string())),
        product: non_empty(product).or_else(|| adapter.as_ref().map(|a| a.product.to_string())),
        serial_number: non_empty(serial_number),
        vid,
        pid,
        display_name: String::new(),
    };
    port.display_name = generate_display_name(&port);
    port
}

/// Convert an OS enumeration record from the `serialport` crate.
pub fn descriptor_from_os(info: &serialport::SerialPortInfo) -> PortDescriptor {
    match &info.port_type {
        serialport::SerialPortType::UsbPort(usb) => build_port_descriptor(
            &info.port_name,
            Some(usb.vid),
            Some(usb.pid),
            usb.manufacturer.as_deref(),
            usb.product.as_deref(),
            usb.serial_number.as_deref(),
        ),
        serialport::SerialPortType::BluetoothPort => {
            let mut port = build_port_descriptor(&info.port_name, None, None, None, None, None);
            port.port_type = PortType::Bluetooth;
            port
        }
        serialport::SerialPortType::PciPort => {
            let mut port = build_port_descriptor(&info.port_name, None, None, None, None, None);
            port.port_type = PortType::Native;
            port
        }
        serialport::SerialPortType::Unknown => {
            build_port_descriptor(&info.port_name, None, None, None, None, None)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Ranking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether the manufacturer string names a known board vendor.
pub fn is_known_vendor(port: &PortDescriptor) -> bool {
    port.manufacturer
        .as_deref()
        .map(|m| {
            let lower = m.to_lowercase();
            KNOWN_VENDOR_TOKENS.iter().any(|token| lower.contains(token))
        })
        .unwrap_or(false)
}

/// Stable partition: known-vendor ports first, original order otherwise.
pub fn rank_for_auto_connect(ports: Vec<PortDescriptor>) -> Vec<PortDescriptor> {
    let (mut known, other): (Vec<_>, Vec<_>) = ports.into_iter().partition(is_known_vendor);
    known.extend(other);
    known
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Discovery service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Port enumeration plus last-device persistence.
pub struct PortDiscovery {
    transport: Arc<dyn SerialTransport>,
    store: LastDeviceStore,
}

impl PortDiscovery {
    pub fn new(transport: Arc<dyn SerialTransport>, store: LastDeviceStore) -> Self {
        Self { transport, store }
    }

    /// Enumerate ports. Never fails: errors are logged and yield an empty
    /// list.
    pub async fn list_ports(&self) -> Vec<PortDescriptor> {
        match self.transport.list_ports().await {
            Ok(ports) => {
                log::debug!("Found {} serial port(s)", ports.len());
                ports
            }
            Err(e) => {
                log::warn!("Port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Enumerated ports in auto-connect order.
    pub async fn ranked_ports(&self) -> Vec<PortDescriptor> {
        rank_for_auto_connect(self.list_ports().await)
    }

    pub fn load_last_device(&self) -> Option<LastDeviceRecord> {
        self.store.load()
    }

    pub fn save_last_device(&self, port: &PortDescriptor) -> Result<(), SerialError> {
        self.store.save(port)
    }

    pub fn store(&self) -> &LastDeviceStore {
        &self.store
    }
}
