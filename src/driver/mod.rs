//! Driver protocol abstraction.
//!
//! The original source's `BaseUSBDeviceHandler` / `CommonUSBDeviceHandler` /
//! `Ch34xDeviceHandler` class hierarchy exists to share the transfer engine
//! across chip families. Here that's a `Driver` trait implemented by
//! concrete driver structs; the transfer engine and lifecycle supervisor
//! hold a boxed driver and stay non-generic.

pub mod ch34x;

use crate::error::Result;
use crate::params::SerialParams;
use nusb::Interface;

/// Endpoint addresses a driver wants the transfer engine to use.
#[derive(Debug, Copy, Clone)]
pub struct DriverEndpoints {
    pub read_ep: u8,
    pub write_ep: u8,
    pub chunk_size: usize,
}

/// A chip-specific control-transfer protocol driver.
///
/// Implementations own no USB resources directly: they're handed a claimed
/// [`Interface`] for every operation and issue control transfers against it.
pub trait Driver: Send {
    /// Interface number this driver expects to be claimed on.
    fn interface_number(&self) -> u8;

    /// Endpoint addresses and transfer chunk size for this chip.
    fn endpoints(&self) -> DriverEndpoints;

    /// Run the chip-specific init sequence. Called once per `claim_interface`.
    fn init(&mut self, interface: &Interface, initial_params: &SerialParams) -> Result<()>;

    /// Apply baud/data-bits/stop-bits/parity. Each call reaches the chip
    /// before returning success.
    fn set_parameters(&mut self, interface: &Interface, params: &SerialParams) -> Result<()>;

    /// Assert/deassert DTR and RTS.
    fn set_control_lines(&mut self, interface: &Interface, dtr: bool, rts: bool) -> Result<()>;

    /// Assert/deassert a break condition.
    fn set_break(&mut self, interface: &Interface, asserted: bool) -> Result<()>;
}

/// Construct a driver by name, for `--driver` CLI selection.
pub fn by_name(name: &str) -> Option<Box<dyn Driver>> {
    match name {
        "ch34x" => Some(Box::new(ch34x::Ch34x::new())),
        _ => None,
    }
}
