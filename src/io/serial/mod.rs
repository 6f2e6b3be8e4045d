// src/io/serial/mod.rs
//
// TA612C serial driver.
//
// Features:
// - Port discovery with USB preference
// - Fixed 9600 8N1 line parameters
// - Frame decoding (sync, length, sum8 checksum) and temperature extraction

pub mod framer;
pub mod port;
pub mod reading;

pub use framer::{readings_from_frames, Ta612cFramer};
pub use port::{list_ports, open_port, select_port, SerialDuplex, SerialPortInfo};
pub use reading::Reading;
