//! Chip driver plug-in mechanism.
//!
//! A [`SerialDriver`] embodies everything chip-specific: the vendor
//! control sequences that program baud rate, line format and flow control,
//! the bulk endpoint layout, and the interpretation of transfer buffers
//! (for chips that frame their bulk-in data). Drivers are produced by an
//! ordered factory list; the first factory that recognises a device wins.

mod ch34x;
pub mod ftdi;
mod generic;
mod pl2303;

pub(crate) use generic::GenericDriver;

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::types::Protocol;
use crate::usb::{BulkIn, BulkOut, UsbDevice};

/// Bulk endpoint layout of one UART interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Bulk IN endpoint address (bit 7 set).
    pub ep_bulk_in: u8,
    /// Bulk OUT endpoint address.
    pub ep_bulk_out: u8,
    /// Transfer payload size used on both endpoints.
    pub chunk_size: usize,
}

/// A per-channel chip driver.
///
/// The driver owns the USB device handle and the claimed interface; both
/// are released when the driver is dropped, after the channel has drained
/// its transfers.
pub trait SerialDriver: Send {
    /// The endpoint layout this driver selected for its interface.
    fn info(&self) -> &InterfaceInfo;

    /// Open the bulk endpoint pair the channel will pump.
    fn open_endpoints(&self) -> Result<(Box<dyn BulkIn>, Box<dyn BulkOut>)>;

    /// Program the full line protocol on the hardware.
    fn setup(&self, proto: &Protocol) -> Result<()>;

    /// Program the baud rate only, leaving other line properties intact.
    fn set_baudrate(&self, baudrate: u32) -> Result<()>;

    /// Reset the chip. Default: nothing to do.
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// Send an RS-232 break. Default: unsupported.
    fn sendbreak(&self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Called on bulk IN completion. Returns the position of the first
    /// payload byte in `data` (chips that prepend framing skip it here).
    /// Default: the whole buffer is payload.
    fn read_callback(&mut self, _data: &mut Vec<u8>) -> usize {
        0
    }

    /// Called after a bulk OUT transfer fully completes. Default: nothing.
    fn write_callback(&mut self, _data: &[u8]) {}

    /// Called before pipe bytes are placed into an OUT buffer so the
    /// driver can prepend hardware-specific payload. Default: nothing.
    fn prepare_write(&mut self, _buf: &mut Vec<u8>) {}
}

/// A chip family's entry in the registry.
///
/// `create` returns `Ok(None)` when the device is not this family's
/// (matching is by VID/PID tables only). Once a factory recognises the
/// device, any probe failure is final; creation does not fall through to
/// later factories.
pub trait DriverFactory: Sync {
    /// Name used in log lines.
    fn name(&self) -> &'static str;

    /// Recognise and construct a driver for `device`, claiming `ifc`.
    fn create(&self, device: &Arc<dyn UsbDevice>, ifc: u8)
        -> Result<Option<Box<dyn SerialDriver>>>;
}

/// Registered chip families, walked in order.
static FACTORIES: &[&dyn DriverFactory] =
    &[&ch34x::Factory, &ftdi::Factory, &pl2303::Factory];

/// Find the driver for an opened device, or fail with `NotSupported`.
pub fn create_driver(device: &Arc<dyn UsbDevice>, ifc: u8) -> Result<Box<dyn SerialDriver>> {
    let desc = device.descriptor();
    for factory in FACTORIES {
        if let Some(driver) = factory.create(device, ifc)? {
            info!(
                "driver {} bound to {:04x}:{:04x}",
                factory.name(),
                desc.vendor_id,
                desc.product_id
            );
            return Ok(driver);
        }
    }
    Err(Error::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::fake::FakeDevice;
    use crate::usb::{DeviceDesc, UsbBus, UsbDeviceInfo};

    fn open(dev: std::sync::Arc<FakeDevice>) -> Arc<dyn UsbDevice> {
        let bus = crate::usb::fake::FakeBus::new();
        bus.plug(dev);
        bus.devices().unwrap().remove(0).open().unwrap()
    }

    #[test]
    fn first_matching_factory_wins() {
        let dev = open(FakeDevice::loopback(0x1a86, 0x7523));
        let driver = create_driver(&dev, 0).unwrap();
        // CH34x layout, not FTDI or PL2303.
        assert_eq!(driver.info().chunk_size, 256);
        assert_eq!(driver.info().ep_bulk_in, 0x82);
    }

    #[test]
    fn unknown_device_is_not_supported() {
        let dev = open(FakeDevice::loopback(0xdead, 0xbeef));
        assert!(matches!(create_driver(&dev, 0), Err(Error::NotSupported)));
    }

    #[test]
    fn probe_failure_surfaces_without_fallthrough() {
        let fake = FakeDevice::loopback(0x1a86, 0x7523);
        fake.fail_controls();
        let dev = open(fake);
        // The CH34x factory recognised the device, so its probe failure is
        // final rather than falling through to NotSupported.
        assert!(matches!(create_driver(&dev, 0), Err(Error::Control)));
    }

    #[test]
    fn ftdi_selected_by_vid() {
        let dev = open(FakeDevice::with_descriptor(DeviceDesc {
            vendor_id: 0x0403,
            product_id: 0x6001,
            bcd_device: 0x0600,
            class: 0,
            max_packet_size_0: 8,
            bus_number: 1,
            address: 3,
        }));
        let driver = create_driver(&dev, 0).unwrap();
        assert_eq!(driver.info().chunk_size, 64);
    }
}
