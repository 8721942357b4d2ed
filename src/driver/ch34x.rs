//! CH340 / CH341 control-transfer protocol.
//!
//! Constants and sequencing are normative, grounded on the original
//! `usbpty` Python driver (itself derived from `usb-serial-for-android`'s
//! `Ch34xSerialDriver`) and cross-checked against the FreeBSD/Linux in-tree
//! `uchcom`/`ch341` kernel drivers referenced there.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::Interface;

use crate::driver::{Driver, DriverEndpoints};
use crate::error::{Error, ErrorKind, Result};
use crate::params::{DataBits, Parity, SerialParams, StopBits};

const LCR_ENABLE_RX: u8 = 0x80;
const LCR_ENABLE_TX: u8 = 0x40;
const LCR_MARK_SPACE: u8 = 0x20;
const LCR_PAR_EVEN: u8 = 0x10;
const LCR_ENABLE_PAR: u8 = 0x08;
const LCR_STOP_BITS_2: u8 = 0x04;
const LCR_CS8: u8 = 0x03;
const LCR_CS7: u8 = 0x02;
const LCR_CS6: u8 = 0x01;
const LCR_CS5: u8 = 0x00;

const SCL_DTR: u16 = 0x20;
const SCL_RTS: u16 = 0x40;

const READ_ENDPOINT: u8 = 0x82;
const WRITE_ENDPOINT: u8 = 0x02;
const CHUNK_SIZE: usize = 32;
const TIMEOUT: Duration = Duration::from_millis(5000);

const DEFAULT_BAUD_RATE: u32 = 115_200;
const BAUDBASE_FACTOR: u64 = 1_532_620_800;
const BAUDBASE_DIVMAX: u32 = 3;

/// Minimum chip version supporting the `0xA4` DTR/RTS control-line request.
/// Below this, the chip uses a different (unimplemented) handshake.
const MIN_VERSION_FOR_CONTROL_LINES: u8 = 20;

/// CH340/CH341 driver state. `chip_version` is learned during `init` and
/// gates whether `set_control_lines` is supported at all.
pub struct Ch34x {
    chip_version: Option<u8>,
}

impl Ch34x {
    pub fn new() -> Self {
        Self { chip_version: None }
    }

    fn control_out(&self, interface: &Interface, request: u8, value: u16, index: u16) -> Result<()> {
        use nusb::MaybeFuture;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data: &[],
                },
                TIMEOUT,
            )
            .wait()
            .map_err(Error::from)
    }

    fn control_in(&self, interface: &Interface, request: u8, value: u16, index: u16, length: u16) -> Result<Vec<u8>> {
        use nusb::MaybeFuture;
        interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length,
                },
                TIMEOUT,
            )
            .wait()
            .map_err(Error::from)
    }

    /// Read `expected.len()` bytes and compare against `expected`, where
    /// `None` means "don't care". A mismatch is a fatal init error carrying
    /// `stage` as a diagnostic label.
    fn check_state(
        &self,
        interface: &Interface,
        stage: &str,
        value: u16,
        expected: &[Option<u8>],
    ) -> Result<()> {
        let buf = self.control_in(interface, 0x95, value, 0, expected.len() as u16)?;
        if buf.len() != expected.len() {
            return Err(Error::new(
                ErrorKind::Init,
                format!(
                    "check_state[{stage}]: expected {} bytes but got {}",
                    expected.len(),
                    buf.len()
                ),
            ));
        }
        for (i, want) in expected.iter().enumerate() {
            let Some(want) = want else { continue };
            if buf[i] != *want {
                return Err(Error::new(
                    ErrorKind::Init,
                    format!(
                        "check_state[{stage}]: expected 0x{want:02x} at byte {i}, got 0x{:02x}",
                        buf[i]
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Compute the two control-transfer values for a baud rate, per the
    /// CH340/CH341 baud divisor formula.
    fn baud_values(rate: u32) -> Result<(u16, u8)> {
        if rate == 0 {
            return Err(Error::new(ErrorKind::InvalidParam, "baud rate must be positive"));
        }

        let (factor, mut divisor): (u64, u32) = if rate == 921_600 {
            (0xF300, 7)
        } else {
            let mut factor = BAUDBASE_FACTOR / rate as u64;
            let mut divisor = BAUDBASE_DIVMAX;
            while factor > 0xFFF0 && divisor > 0 {
                factor >>= 3;
                divisor -= 1;
            }
            if factor > 0xFFF0 {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    format!("unsupported baud rate: {rate}"),
                ));
            }
            factor = 0x10000 - factor;
            (factor, divisor)
        };

        divisor |= 0x0080;
        let val1 = ((factor & 0xFF00) as u16) | divisor as u16;
        let val2 = (factor & 0x00FF) as u8;
        Ok((val1, val2))
    }

    fn set_baud_rate(&self, interface: &Interface, rate: u32) -> Result<()> {
        let (val1, val2) = Self::baud_values(rate)?;
        self.control_out(interface, 0x9A, 0x1312, val1)?;
        self.control_out(interface, 0x9A, 0x0F2C, val2 as u16)?;
        Ok(())
    }

    fn lcr_value(params: &SerialParams) -> Result<u8> {
        let mut lcr = LCR_ENABLE_RX | LCR_ENABLE_TX;

        lcr |= match params.data_bits {
            DataBits::Five => LCR_CS5,
            DataBits::Six => LCR_CS6,
            DataBits::Seven => LCR_CS7,
            DataBits::Eight => LCR_CS8,
        };

        lcr |= match params.parity {
            Parity::None => 0,
            Parity::Odd => LCR_ENABLE_PAR,
            Parity::Even => LCR_ENABLE_PAR | LCR_PAR_EVEN,
            Parity::Mark => LCR_ENABLE_PAR | LCR_MARK_SPACE,
            Parity::Space => LCR_ENABLE_PAR | LCR_MARK_SPACE | LCR_PAR_EVEN,
        };

        match params.stop_bits {
            StopBits::One => {}
            StopBits::Two => lcr |= LCR_STOP_BITS_2,
            StopBits::OnePointFive => {
                return Err(Error::new(ErrorKind::Unsupported, "1.5 stop bits are not supported"))
            }
        }

        Ok(lcr)
    }
}

impl Default for Ch34x {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for Ch34x {
    fn interface_number(&self) -> u8 {
        0
    }

    fn endpoints(&self) -> DriverEndpoints {
        DriverEndpoints {
            read_ep: READ_ENDPOINT,
            write_ep: WRITE_ENDPOINT,
            chunk_size: CHUNK_SIZE,
        }
    }

    fn init(&mut self, interface: &Interface, initial_params: &SerialParams) -> Result<()> {
        // 1. Chip version.
        let version = self.control_in(interface, 0x5F, 0, 0, 8)?;
        let chip_version = *version
            .first()
            .ok_or_else(|| Error::new(ErrorKind::Init, "chip version check returned no data"))?;
        self.chip_version = Some(chip_version);
        log::debug!("ch34x: chip version 0x{chip_version:02x}");

        // 2. Chip clear.
        self.control_out(interface, 0xA1, 0, 0)?;

        // 3. Default baud (first of three; see DESIGN.md on why all three
        // are preserved).
        self.set_baud_rate(interface, DEFAULT_BAUD_RATE)?;

        // 4. Check-state.
        self.check_state(interface, "init #4", 0x2518, &[None, Some(0x00)])?;

        // 5. Line control register.
        self.control_out(interface, 0x9A, 0x2518, (LCR_ENABLE_RX | LCR_ENABLE_TX | LCR_CS8) as u16)?;

        // 6. Check-state.
        self.check_state(interface, "init #6", 0x0706, &[None, None])?;

        // 7. Chip reset.
        self.control_out(interface, 0xA1, 0x501F, 0xD90A)?;

        // 8. Default baud again.
        self.set_baud_rate(interface, DEFAULT_BAUD_RATE)?;

        // 9. DTR + RTS on.
        self.set_control_lines(interface, true, true)?;

        // 10. Caller-requested baud.
        self.set_baud_rate(interface, initial_params.baud_rate)?;

        Ok(())
    }

    fn set_parameters(&mut self, interface: &Interface, params: &SerialParams) -> Result<()> {
        if params.baud_rate == 0 {
            return Err(Error::new(ErrorKind::InvalidParam, "baud rate must be positive"));
        }
        self.set_baud_rate(interface, params.baud_rate)?;

        let lcr = Self::lcr_value(params)?;
        self.control_out(interface, 0x9A, 0x2518, lcr as u16)?;
        Ok(())
    }

    fn set_control_lines(&mut self, interface: &Interface, dtr: bool, rts: bool) -> Result<()> {
        let chip_version = self
            .chip_version
            .ok_or_else(|| Error::new(ErrorKind::Init, "set_control_lines called before init"))?;

        if chip_version < MIN_VERSION_FOR_CONTROL_LINES {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!(
                    "chip version 0x{chip_version:02x} uses the legacy DTR/RTS handshake (registers 0x06 / request 0xA4), which is not implemented"
                ),
            ));
        }

        let mut value: u16 = 0;
        if dtr {
            value |= SCL_DTR;
        }
        if rts {
            value |= SCL_RTS;
        }

        self.control_out(interface, 0xA4, value, 0)
    }

    fn set_break(&mut self, interface: &Interface, asserted: bool) -> Result<()> {
        let buf = self.control_in(interface, 0x95, 0x1805, 0, 2)?;
        if buf.len() != 2 {
            return Err(Error::new(ErrorKind::Init, "break check returned fewer than 2 bytes"));
        }
        let (mut b0, mut b1) = (buf[0], buf[1]);
        if asserted {
            b0 &= !1;
            b1 &= !0x40;
        } else {
            b0 |= 1;
            b1 |= 0x40;
        }
        let ctl = ((b1 as u16) << 8) | b0 as u16;
        self.control_out(interface, 0x9A, 0x1805, ctl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_921600_takes_fast_path() {
        let (val1, val2) = Ch34x::baud_values(921_600).unwrap();
        // factor = 0xF300, divisor = 7 | 0x0080 = 0x0087
        assert_eq!(val1, 0xF387);
        assert_eq!(val2, 0x00);
    }

    #[test]
    fn baud_zero_is_invalid() {
        let err = Ch34x::baud_values(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn baud_round_trip_is_stable() {
        for rate in [1200, 9600, 19200, 57600, 115200, 250000, 500000, 921600] {
            let a = Ch34x::baud_values(rate).unwrap();
            let b = Ch34x::baud_values(rate).unwrap();
            assert_eq!(a, b, "baud computation for {rate} is not stable");
        }
    }

    #[test]
    fn baud_9600_matches_known_divisor() {
        // factor = 1_532_620_800 / 9600 = 159_648 -> too big, shift right by 3 repeatedly
        let (val1, val2) = Ch34x::baud_values(9600).unwrap();
        // Recompute by hand to cross-check against the formula, independent
        // of the implementation under test.
        let mut factor = BAUDBASE_FACTOR / 9600;
        let mut divisor = BAUDBASE_DIVMAX;
        while factor > 0xFFF0 && divisor > 0 {
            factor >>= 3;
            divisor -= 1;
        }
        assert!(factor <= 0xFFF0);
        factor = 0x10000 - factor;
        divisor |= 0x0080;
        let expected_val1 = ((factor & 0xFF00) as u16) | divisor as u16;
        let expected_val2 = (factor & 0xFF) as u8;
        assert_eq!(val1, expected_val1);
        assert_eq!(val2, expected_val2);
    }

    #[test]
    fn lcr_value_rejects_onepointfive_stop_bits() {
        let params = SerialParams {
            stop_bits: StopBits::OnePointFive,
            ..Default::default()
        };
        let err = Ch34x::lcr_value(&params).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn lcr_value_encodes_parity_and_stop_bits() {
        let params = SerialParams {
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            ..Default::default()
        };
        let lcr = Ch34x::lcr_value(&params).unwrap();
        assert_eq!(
            lcr,
            LCR_ENABLE_RX | LCR_ENABLE_TX | LCR_CS8 | LCR_ENABLE_PAR | LCR_PAR_EVEN | LCR_STOP_BITS_2
        );
    }

    #[test]
    fn legacy_chip_version_fails_closed_on_control_lines() {
        let mut driver = Ch34x::new();
        driver.chip_version = Some(19);
        // We can't exercise `set_control_lines` without a real `Interface`,
        // but the version gate itself is synchronous and testable directly.
        assert!(driver.chip_version.unwrap() < MIN_VERSION_FOR_CONTROL_LINES);
    }
}
