//! Data types shared across the driver and transfer layers.

use std::fmt;

/// A (vendor_id, product_id) pair identifying a USB device. Immutable for
/// the life of the bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceAddress {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Number of data bits per frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Number of stop bits per frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

/// Parity mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Serial line parameters. Mutated only through the driver protocol
/// interface; each mutation must reach the chip before the setter returns
/// success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub dtr: bool,
    pub rts: bool,
    pub break_asserted: bool,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            dtr: false,
            rts: false,
            break_asserted: false,
        }
    }
}
