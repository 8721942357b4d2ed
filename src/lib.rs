//! Userspace bridge from a CH340/CH341 USB serial chip to a Unix PTY.
//!
//! See the [`driver`] module for the chip protocol, [`transfer`] for the
//! bidirectional transfer engine, and [`supervisor`] for the lifecycle state
//! machine tying them together.

pub mod driver;
pub mod error;
pub mod params;
pub mod pty;
pub mod supervisor;
pub mod transfer;

pub use error::{Error, ErrorKind};
pub use params::{DataBits, DeviceAddress, Parity, SerialParams, StopBits};
pub use supervisor::Supervisor;
