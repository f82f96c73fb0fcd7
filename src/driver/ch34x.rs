//! Driver for WCH CH340/CH341 adapters.

use std::sync::Arc;

use tracing::info;

use crate::driver::{DriverFactory, GenericDriver, InterfaceInfo, SerialDriver};
use crate::error::{Error, Result};
use crate::types::{FlowControl, Protocol};
use crate::usb::{BulkIn, BulkOut, UsbDevice};

const IFC: InterfaceInfo = InterfaceInfo {
    ep_bulk_in: 0x82,
    ep_bulk_out: 0x02,
    chunk_size: 256,
};

/// Supported VID/PID pairs.
const SUPPORTED: [(u16, u16); 3] = [(0x4348, 0x5523), (0x1a86, 0x7523), (0x1a86, 0x5523)];

/// The chip's divisor pair for each supported rate. Rates outside this
/// table cannot be programmed.
const BAUD_TABLE: [(u32, u16, u16); 7] = [
    (2_400, 0xd901, 0x0038),
    (4_800, 0x6402, 0x001f),
    (9_600, 0xb202, 0x0013),
    (19_200, 0xd902, 0x000d),
    (38_400, 0x6403, 0x000a),
    (57_600, 0x9803, 0x0010),
    (115_200, 0xcc03, 0x0008),
];

/// Look up the divisor registers for `baudrate`.
pub(crate) fn divisors_for(baudrate: u32) -> Option<(u16, u16)> {
    BAUD_TABLE
        .iter()
        .find(|&&(baud, _, _)| baud == baudrate)
        .map(|&(_, div1, div2)| (div1, div2))
}

pub(crate) struct Ch34x {
    base: GenericDriver,
}

impl Ch34x {
    fn new(device: Arc<dyn UsbDevice>, ifcnum: u8) -> Result<Self> {
        Ok(Self {
            base: GenericDriver::claim(device, IFC, ifcnum)?,
        })
    }

    /// Vendor initialization sequence; the chip answers these before it
    /// will move serial data.
    fn probe(&self) -> Result<()> {
        self.base.write_cv(0xa1, 0, 0)?;
        self.base.write_cv(0x9a, 0x2518, 0x0050)?;
        self.base.write_cv(0xa1, 0x501f, 0xd90a)
    }

    fn set_flowcontrol(&self, fc: FlowControl) -> Result<()> {
        let mask: u16 = match fc {
            FlowControl::RtsCts => !(1 << 6),
            FlowControl::DtrDsr => !(1 << 5),
            _ => 0x00ff,
        };
        self.base.write_cv(0xa4, mask, 0)
    }
}

impl SerialDriver for Ch34x {
    fn info(&self) -> &InterfaceInfo {
        self.base.info()
    }

    fn open_endpoints(&self) -> Result<(Box<dyn BulkIn>, Box<dyn BulkOut>)> {
        self.base.open_endpoints()
    }

    fn setup(&self, proto: &Protocol) -> Result<()> {
        self.set_baudrate(proto.baudrate)?;
        self.set_flowcontrol(proto.flowcontrol)?;
        self.reset()
    }

    fn set_baudrate(&self, baudrate: u32) -> Result<()> {
        let (div1, div2) = divisors_for(baudrate).ok_or(Error::BadBaudrate(baudrate))?;
        self.base.write_cv(0x9a, 0x1312, div1)?;
        self.base.write_cv(0x9a, 0x0f2c, div2)
    }

    fn reset(&self) -> Result<()> {
        // No documented sequence for resetting the chip.
        Ok(())
    }
}

pub(super) struct Factory;

impl DriverFactory for Factory {
    fn name(&self) -> &'static str {
        "ch34x"
    }

    fn create(
        &self,
        device: &Arc<dyn UsbDevice>,
        ifc: u8,
    ) -> Result<Option<Box<dyn SerialDriver>>> {
        let desc = device.descriptor();
        if !SUPPORTED.contains(&(desc.vendor_id, desc.product_id)) {
            return Ok(None);
        }
        info!(
            "probing ch34x for {:04x}:{:04x}",
            desc.vendor_id, desc.product_id
        );
        let driver = Ch34x::new(device.clone(), ifc)?;
        driver.probe().inspect_err(|err| {
            info!(
                "ch34x probe error {err} for {:04x}:{:04x}",
                desc.vendor_id, desc.product_id
            );
        })?;
        Ok(Some(Box::new(driver)))
    }
}
