//! Driver for FTDI FT232/FT2232/FT4232 family adapters.
//!
//! The divisor encoding follows AN232B-05: a 14-bit integer divisor plus a
//! 3-bit sub-integer prescaler spread over the top bits of `value` and bit
//! 8 of `index`. H-type parts can additionally run from the 120 MHz clock
//! with a /10 prescaler. FT8U232AM's reduced prescaler set is disregarded.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::driver::{DriverFactory, GenericDriver, InterfaceInfo, SerialDriver};
use crate::error::{Error, Result};
use crate::types::Protocol;
use crate::usb::{BulkIn, BulkOut, UsbDevice};

const RESET_REQ: u8 = 0x00;
const SET_FLOWCONTROL_REQ: u8 = 0x02;
const SET_BAUDRATE_REQ: u8 = 0x03;
const SET_DATA_REQ: u8 = 0x04;

const HIGH_CLK: u32 = 120_000_000;
const LOW_CLK: u32 = 48_000_000;

// Bits of the second status byte prepended to every bulk IN transfer.
const OVERRUN_ERROR: u8 = 1 << 1;
const PARITY_ERROR: u8 = 1 << 2;
const FRAMING_ERROR: u8 = 1 << 3;
const BREAK_INTERRUPT: u8 = 1 << 4;

const ERROR_MASK: u8 = BREAK_INTERRUPT | FRAMING_ERROR | PARITY_ERROR | OVERRUN_ERROR;

/// 512-byte transfers put out-of-band data (status bytes) in-band, so the
/// chunk stays at one packet.
const CHUNK: usize = 64;

const L_IFC: InterfaceInfo = InterfaceInfo {
    ep_bulk_in: 0x81,
    ep_bulk_out: 0x02,
    chunk_size: CHUNK,
};

const H_IFCS: [InterfaceInfo; 4] = [
    InterfaceInfo { ep_bulk_in: 0x81, ep_bulk_out: 0x02, chunk_size: CHUNK },
    InterfaceInfo { ep_bulk_in: 0x83, ep_bulk_out: 0x04, chunk_size: CHUNK },
    InterfaceInfo { ep_bulk_in: 0x85, ep_bulk_out: 0x06, chunk_size: CHUNK },
    InterfaceInfo { ep_bulk_in: 0x87, ep_bulk_out: 0x08, chunk_size: CHUNK },
];

/// Sub-integer prescaler selector, indexed by the low three divisor bits.
/// Bits 14-15 land in `value`, bit 8 in `index`.
const MAPPER: [u16; 8] = [
    0x0000, 0xC000, 0x8000, 0x0100, 0x4000, 0x4100, 0x8100, 0xC100,
];

/// Encode `baudrate` into the `SET_BAUDRATE` (value, index) pair. The
/// interface number is OR-ed into `index` at the write site.
///
/// `baudrate` must be non-zero; the API boundary validates it before any
/// driver code runs.
pub fn compute_divisors(baudrate: u32, high_speed: bool) -> (u16, u16) {
    // Highest rate at which the 14-bit divisor still fits when running
    // from the high-speed clock.
    const LOW_LIMIT: u32 = (HIGH_CLK / 10) >> 14;

    let clk = if high_speed { HIGH_CLK } else { LOW_CLK };
    let prescaler: u32 = if high_speed && baudrate > LOW_LIMIT { 10 } else { 16 };

    let mut divisor = (clk << 3) / baudrate + (prescaler >> 1) - 1;
    divisor /= prescaler;

    let index = (MAPPER[(divisor & 7) as usize] & 0x0100)
        | if prescaler == 10 { 0x0200 } else { 0 };
    let value = ((divisor >> 3) & 0x3FFF) as u16 | (MAPPER[(divisor & 7) as usize] & 0xC000);
    (value, index)
}

pub(crate) struct Ftdi {
    base: GenericDriver,
    is_h: bool,
    /// Sticky accumulation of line error bits seen on the read path.
    #[allow(dead_code)] // Surfaced through the warn logs only
    errors: u8,
}

impl Ftdi {
    fn new(device: Arc<dyn UsbDevice>, ifcnum: u8, is_h: bool) -> Result<Self> {
        let info = if is_h { H_IFCS[ifcnum as usize] } else { L_IFC };
        Ok(Self {
            base: GenericDriver::claim(device, info, ifcnum)?,
            is_h,
            errors: 0,
        })
    }

    fn set_line_props(&self, proto: &Protocol) -> Result<()> {
        let value = proto.databits.wire_value() as u16
            | (proto.parity.wire_value() as u16) << 8
            | (proto.stopbits.wire_value() as u16) << 11;
        self.base
            .write_cv(SET_DATA_REQ, value, self.base.ifcnum() as u16)?;
        self.base.write_cv(
            SET_FLOWCONTROL_REQ,
            proto.flowcontrol.wire_value() as u16,
            self.base.ifcnum() as u16,
        )
    }
}

impl SerialDriver for Ftdi {
    fn info(&self) -> &InterfaceInfo {
        self.base.info()
    }

    fn open_endpoints(&self) -> Result<(Box<dyn BulkIn>, Box<dyn BulkOut>)> {
        self.base.open_endpoints()
    }

    fn setup(&self, proto: &Protocol) -> Result<()> {
        self.set_baudrate(proto.baudrate)?;
        self.set_line_props(proto)?;
        self.reset()
    }

    fn set_baudrate(&self, baudrate: u32) -> Result<()> {
        let (value, index) = compute_divisors(baudrate, self.is_h);
        info!("baudrate={baudrate} v={value:#06x} i={index:#06x}");
        self.base
            .write_cv(SET_BAUDRATE_REQ, value, index | self.base.ifcnum() as u16)
    }

    fn reset(&self) -> Result<()> {
        self.base.write_cv(RESET_REQ, 0, self.base.ifcnum() as u16)
    }

    fn read_callback(&mut self, data: &mut Vec<u8>) -> usize {
        if data.len() < 2 {
            warn!("malformed transfer");
            data.clear();
            return 0;
        }
        let err = data[1] & ERROR_MASK;
        if err != 0 {
            self.errors |= err;
            warn!(
                "line error {err:02x}:{}{}{}{}",
                if err & BREAK_INTERRUPT != 0 { " break" } else { "" },
                if err & FRAMING_ERROR != 0 { " framing" } else { "" },
                if err & PARITY_ERROR != 0 { " parity" } else { "" },
                if err & OVERRUN_ERROR != 0 { " overrun" } else { "" },
            );
        }
        2
    }
}

pub(super) struct Factory;

/// PIDs FTDI assigns to its UART parts.
const PIDS: [u16; 5] = [0x6001, 0x6010, 0x6011, 0x6014, 0x6015];

/// PIDs that are (or can be) high-speed generation parts.
const HIGH_SPEED: [u16; 3] = [0x6010, 0x6011, 0x6014];

impl DriverFactory for Factory {
    fn name(&self) -> &'static str {
        "ftdi"
    }

    fn create(
        &self,
        device: &Arc<dyn UsbDevice>,
        ifc: u8,
    ) -> Result<Option<Box<dyn SerialDriver>>> {
        let desc = device.descriptor();
        if desc.vendor_id != 0x0403 {
            return Ok(None);
        }

        if ifc as usize >= H_IFCS.len() {
            error!("interface #{ifc} exceeds limit {}", H_IFCS.len());
            return Err(Error::InvalidParam("interface"));
        }

        // 0x6010 is shared between FT2232C/D/L (normal speed) and
        // FT2232H (high speed); TN_104 says to disambiguate via bcdDevice:
        // 0x0700 = FT2232H, 0x0800 = FT4232H, 0x0900 = FT232H.
        let is_h = if PIDS.contains(&desc.product_id) {
            (desc.product_id == HIGH_SPEED[0] && desc.bcd_device == 0x0700)
                || desc.product_id == HIGH_SPEED[1]
                || desc.product_id == HIGH_SPEED[2]
        } else {
            matches!(desc.bcd_device, 0x0700 | 0x0800 | 0x0900)
        };

        if !is_h && ifc != 0 {
            error!("interface #{ifc} exceeds limit 0");
            return Err(Error::InvalidParam("interface"));
        }

        info!(
            "probing ftdi for {:04x}:{:04x}",
            desc.vendor_id, desc.product_id
        );
        Ok(Some(Box::new(Ftdi::new(device.clone(), ifc, is_h)?)))
    }
}
