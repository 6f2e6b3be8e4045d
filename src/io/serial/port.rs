// src/io/serial/port.rs
//
// Serial port discovery and opening for the TA612C.
//
// The TA612C has a built-in CH340/CH341 USB-to-serial converter. USB ports are
// preferred during auto-selection, falling back to every port when none look
// like USB devices.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};

use crate::io::IoError;

// ============================================================================
// Line Parameters
// ============================================================================

/// TA612C line speed.
pub const BAUD_RATE: u32 = 9600;

/// Read timeout. Keeps reads from blocking indefinitely so the reader can
/// notice a closed connection.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Device name fragments for USB serial adapters whose driver does not
/// report USB VID/PID (common with CH340 on some Linux kernels).
const USB_NAME_HINTS: [&str; 4] = ["ttyusb", "ttyacm", "cu.usb", "cu.wch"];

// ============================================================================
// Types
// ============================================================================

/// Serial port description for listing and selection.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub product: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// True if this port looks like a USB serial adapter.
    /// Checks reported VID first, then falls back to device-name patterns.
    pub fn is_usb(&self) -> bool {
        if self.vid.is_some() {
            return true;
        }
        let name = self.port_name.to_lowercase();
        USB_NAME_HINTS.iter().any(|hint| name.contains(hint))
    }

    /// One-line description for the port table.
    pub fn describe(&self) -> String {
        let mut line = format!("{}  ({})", self.port_name, self.port_type);
        if let Some(product) = &self.product {
            line.push_str(&format!("  {}", product));
        }
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            line.push_str(&format!("  VID:PID={:04X}:{:04X}", vid, pid));
        }
        line
    }
}

/// A byte-oriented duplex serial handle shared by every connection.
///
/// Each call to `split` hands out an independent reader and writer for one
/// connection. Writers from concurrent connections are not serialised
/// against each other, so two clients sending at once may interleave at the
/// byte level.
pub trait SerialDuplex: Send + Sync {
    /// Name used in log lines and errors.
    fn name(&self) -> &str;

    /// Obtain a reader/writer pair for one connection.
    fn split(&self) -> std::io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
}

/// An open TA612C serial port.
pub struct SharedSerialPort {
    name: String,
    // Guards handle cloning only; reads and writes go through the clones.
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialDuplex for SharedSerialPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn split(&self) -> std::io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let port = self
            .port
            .lock()
            .map_err(|e| std::io::Error::other(format!("Port mutex poisoned: {}", e)))?;
        let reader = port.try_clone()?;
        let writer = port.try_clone()?;
        Ok((Box::new(reader), Box::new(writer)))
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// List available serial ports.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The tty (terminal) devices block on open waiting for carrier detect.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::configuration("serial", format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, product, vid, pid) = match p.port_type {
                SerialPortType::UsbPort(info) => {
                    ("USB".to_string(), info.product, Some(info.vid), Some(info.pid))
                }
                SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None),
                SerialPortType::PciPort => ("PCI".to_string(), None, None, None),
                SerialPortType::Unknown => ("Unknown".to_string(), None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                product,
                vid,
                pid,
            }
        })
        .collect())
}

/// Choose the port to open.
///
/// An explicitly requested port always wins. Otherwise USB-looking ports are
/// preferred; a single candidate is picked automatically and anything else is
/// reported back so the user can name the port.
pub fn select_port(requested: Option<&str>, available: &[SerialPortInfo]) -> Result<String, IoError> {
    if let Some(port) = requested {
        return Ok(port.to_string());
    }

    let usb: Vec<&SerialPortInfo> = available.iter().filter(|p| p.is_usb()).collect();
    let candidates: Vec<&SerialPortInfo> = if usb.is_empty() {
        available.iter().collect()
    } else {
        usb
    };

    match candidates.as_slice() {
        [] => Err(IoError::configuration(
            "serial",
            "No serial ports found. Connect the TA612C or pass the port explicitly",
        )),
        [only] => Ok(only.port_name.clone()),
        many => {
            let names: Vec<&str> = many.iter().map(|p| p.port_name.as_str()).collect();
            Err(IoError::configuration(
                "serial",
                format!(
                    "Several serial ports found ({}); pass the port to use explicitly",
                    names.join(", ")
                ),
            ))
        }
    }
}

// ============================================================================
// Opening
// ============================================================================

/// Open the port at 9600 8N1 with a short read timeout.
/// On Unix the port is opened exclusively so a second bridge cannot share it.
pub fn open_port(port_name: &str) -> Result<SharedSerialPort, IoError> {
    let builder = serialport::new(port_name, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .timeout(READ_TIMEOUT);

    let open_err = |e: serialport::Error| {
        IoError::connection(
            port_name,
            format!("Cannot open port: {}. Is another bridge already using it?", e),
        )
    };

    #[cfg(unix)]
    let port: Box<dyn SerialPort> = {
        let mut native = builder.open_native().map_err(open_err)?;
        native.set_exclusive(true).map_err(open_err)?;
        Box::new(native)
    };
    #[cfg(not(unix))]
    let port: Box<dyn SerialPort> = builder.open().map_err(open_err)?;

    Ok(SharedSerialPort {
        name: port_name.to_string(),
        port: Mutex::new(port),
    })
}

// ============================================================================
// Tests
// ============================================================================
