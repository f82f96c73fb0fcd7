//! Driver for Prolific PL2303 adapters.

use std::sync::Arc;

use tracing::info;

use crate::driver::{DriverFactory, GenericDriver, InterfaceInfo, SerialDriver};
use crate::error::Result;
use crate::types::Protocol;
use crate::usb::{BulkIn, BulkOut, DeviceDesc, UsbDevice};

const IFC: InterfaceInfo = InterfaceInfo {
    ep_bulk_in: 0x83,
    ep_bulk_out: 0x02,
    chunk_size: 256,
};

const INIT_RQ: u8 = 0x01;
const GET_PROTOCOL_RQT: u8 = 0xa1;
const GET_PROTOCOL_REQ: u8 = 0x21;
const SET_PROTOCOL_RQT: u8 = 0x21;
const SET_PROTOCOL_REQ: u8 = 0x20;
const BREAK_RQT: u8 = 0x21;
const BREAK_REQ: u8 = 0x23;

// HX-only soft reset of the two bulk FIFOs.
const RESET_RD_REQ: u8 = 0x08;
const RESET_WR_REQ: u8 = 0x09;

/// Known PL2303 VID/PID pairs (the Prolific part plus the usual OEM
/// brandings from the same id list the kernel driver carries).
const SUPPORTED: [(u16, u16); 9] = [
    (0x067b, 0x2303),
    (0x067b, 0x04bb),
    (0x067b, 0x1234),
    (0x067b, 0xaaa2),
    (0x0557, 0x2008),
    (0x0547, 0x2008),
    (0x04bb, 0x0a03),
    (0x056e, 0x5003),
    (0x0eba, 0x1080),
];

/// The class-specific line coding block: little-endian baud rate followed
/// by the stop bit, parity and data bit selectors, 7 bytes on the wire.
fn protocol_setup(proto: &Protocol) -> [u8; 7] {
    let baud = proto.baudrate.to_le_bytes();
    [
        baud[0],
        baud[1],
        baud[2],
        baud[3],
        proto.stopbits.wire_value(),
        proto.parity.wire_value(),
        proto.databits.wire_value(),
    ]
}

pub(crate) struct Pl2303 {
    base: GenericDriver,
    /// HX-generation part; gains a documented reset sequence.
    hx: bool,
}

impl Pl2303 {
    fn new(device: Arc<dyn UsbDevice>, ifcnum: u8, hx: bool) -> Result<Self> {
        Ok(Self {
            base: GenericDriver::claim(device, IFC, ifcnum)?,
            hx,
        })
    }

    /// HX parts report a vendor-specific class and a 64-byte EP0, legacy
    /// parts a CDC-ish class.
    fn is_hx(desc: &DeviceDesc) -> bool {
        desc.class != 0x00
            && desc.class != 0x02
            && desc.class != 0xff
            && desc.max_packet_size_0 == 0x40
    }

    /// The documented eight-step init dance, followed by the mode writes.
    fn probe(&self) -> Result<()> {
        self.base.read_cv_u8(INIT_RQ, 0x8484)?;
        self.base.write_cv(INIT_RQ, 0x0404, 0)?;
        self.base.read_cv_u8(INIT_RQ, 0x8484)?;
        self.base.read_cv_u8(INIT_RQ, 0x8383)?;
        self.base.read_cv_u8(INIT_RQ, 0x8484)?;
        self.base.write_cv(INIT_RQ, 0x0404, 1)?;
        self.base.read_cv_u8(INIT_RQ, 0x8484)?;
        self.base.read_cv_u8(INIT_RQ, 0x8383)?;
        self.base.write_cv(INIT_RQ, 0x0000, 1)?;
        self.base.write_cv(INIT_RQ, 0x0001, 0)?;
        self.base.write_cv(INIT_RQ, 2, 0x44)
    }
}

impl SerialDriver for Pl2303 {
    fn info(&self) -> &InterfaceInfo {
        self.base.info()
    }

    fn open_endpoints(&self) -> Result<(Box<dyn BulkIn>, Box<dyn BulkOut>)> {
        self.base.open_endpoints()
    }

    fn setup(&self, proto: &Protocol) -> Result<()> {
        let setup = protocol_setup(proto);
        info!(
            "protocol {{{},{},{},{}}}",
            proto.baudrate,
            setup[6],
            setup[5],
            setup[4]
        );
        self.base
            .control_out(SET_PROTOCOL_RQT, SET_PROTOCOL_REQ, &setup)?;
        self.reset()
    }

    fn set_baudrate(&self, baudrate: u32) -> Result<()> {
        let mut setup: [u8; 7] = self
            .base
            .control_in(GET_PROTOCOL_RQT, GET_PROTOCOL_REQ, 7)?
            .try_into()
            .map_err(|_| crate::error::Error::Control)?;
        setup[..4].copy_from_slice(&baudrate.to_le_bytes());
        self.base
            .control_out(SET_PROTOCOL_RQT, SET_PROTOCOL_REQ, &setup)
    }

    fn reset(&self) -> Result<()> {
        if self.hx {
            self.base.write_cv(RESET_RD_REQ, 0, 0)?;
            self.base.write_cv(RESET_WR_REQ, 0, 0)?;
        }
        // Legacy parts have no documented reset sequence.
        Ok(())
    }

    fn sendbreak(&self) -> Result<()> {
        self.base.control_out(BREAK_RQT, BREAK_REQ, &[])
    }
}

pub(super) struct Factory;

impl DriverFactory for Factory {
    fn name(&self) -> &'static str {
        "pl2303"
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
            "probing pl2303 for {:04x}:{:04x}",
            desc.vendor_id, desc.product_id
        );
        let driver = Pl2303::new(device.clone(), ifc, Pl2303::is_hx(&desc))?;
        driver.probe().inspect_err(|err| {
            info!(
                "pl2303 probe error {err} for {:04x}:{:04x}",
                desc.vendor_id, desc.product_id
            );
        })?;
        Ok(Some(Box::new(driver)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataBits, FlowControl, Parity, StopBits};
    use crate::usb::fake::{FakeBus, FakeDevice};
    use crate::usb::{UsbBus, UsbDeviceInfo};

    fn pl2303_desc(class: u8, ep0: u8) -> DeviceDesc {
        DeviceDesc {
            vendor_id: 0x067b,
            product_id: 0x2303,
            bcd_device: 0x0300,
            class,
            max_packet_size_0: ep0,
            bus_number: 1,
            address: 5,
        }
    }

    fn open_pl2303(class: u8, ep0: u8) -> (std::sync::Arc<FakeDevice>, Box<dyn SerialDriver>) {
        let fake = FakeDevice::with_descriptor(pl2303_desc(class, ep0));
        let bus = FakeBus::new();
        bus.plug(fake.clone());
        let dev = bus.devices().unwrap().remove(0).open().unwrap();
        let driver = Factory.create(&dev, 0).unwrap().unwrap();
        (fake, driver)
    }

    #[test]
    fn protocol_setup_is_little_endian_and_packed() {
        let proto = Protocol {
            baudrate: 115_200,
            databits: DataBits::Eight,
            parity: Parity::Even,
            stopbits: StopBits::Two,
            flowcontrol: FlowControl::None,
        };
        // 115200 = 0x0001C200.
        assert_eq!(
            protocol_setup(&proto),
            [0x00, 0xc2, 0x01, 0x00, 2, 2, 8]
        );
    }

    #[test]
    fn hx_classification() {
        assert!(Pl2303::is_hx(&pl2303_desc(0x20, 0x40)));
        assert!(!Pl2303::is_hx(&pl2303_desc(0x00, 0x40)));
        assert!(!Pl2303::is_hx(&pl2303_desc(0x02, 0x40)));
        assert!(!Pl2303::is_hx(&pl2303_desc(0xff, 0x40)));
        assert!(!Pl2303::is_hx(&pl2303_desc(0x20, 0x10)));
    }

    #[test]
    fn probe_issues_the_init_dance() {
        let (fake, _driver) = open_pl2303(0x00, 0x40);
        let seq: Vec<(u8, u8, u16, u16)> = fake
            .controls()
            .iter()
            .map(|c| (c.request_type, c.request, c.value, c.index))
            .collect();
        assert_eq!(
            seq,
            vec![
                (0x40, INIT_RQ, 0x8484, 0),
                (0x40, INIT_RQ, 0x0404, 0),
                (0x40, INIT_RQ, 0x8484, 0),
                (0x40, INIT_RQ, 0x8383, 0),
                (0x40, INIT_RQ, 0x8484, 0),
                (0x40, INIT_RQ, 0x0404, 1),
                (0x40, INIT_RQ, 0x8484, 0),
                (0x40, INIT_RQ, 0x8383, 0),
                (0x40, INIT_RQ, 0x0000, 1),
                (0x40, INIT_RQ, 0x0001, 0),
                (0x40, INIT_RQ, 2, 0x44),
            ]
        );
    }

    #[test]
    fn setup_sends_line_coding() {
        let (fake, driver) = open_pl2303(0x00, 0x40);
        driver.setup(&crate::types::PROTO_19200_8N1).unwrap();
        let last = fake.controls().pop().unwrap();
        assert_eq!((last.request_type, last.request), (0x21, SET_PROTOCOL_REQ));
        assert_eq!(last.data, vec![0x00, 0x4b, 0x00, 0x00, 0, 0, 8]);
    }

    #[test]
    fn hx_reset_writes_both_fifos() {
        let (fake, driver) = open_pl2303(0x20, 0x40);
        driver.reset().unwrap();
        let tail: Vec<(u8, u16, u16)> = fake
            .controls()
            .iter()
            .rev()
            .take(2)
            .rev()
            .map(|c| (c.request, c.value, c.index))
            .collect();
        assert_eq!(tail, vec![(RESET_RD_REQ, 0, 0), (RESET_WR_REQ, 0, 0)]);
    }

    #[test]
    fn legacy_reset_is_a_no_op() {
        let (fake, driver) = open_pl2303(0x00, 0x40);
        let before = fake.controls().len();
        driver.reset().unwrap();
        assert_eq!(fake.controls().len(), before);
    }

    #[test]
    fn sendbreak_is_one_class_request() {
        let (fake, driver) = open_pl2303(0x00, 0x40);
        driver.sendbreak().unwrap();
        let last = fake.controls().pop().unwrap();
        assert_eq!((last.request_type, last.request), (0x21, BREAK_REQ));
    }
}
