//! Shared machinery for chip drivers.
//!
//! [`GenericDriver`] owns the opened device and the claimed interface and
//! provides the vendor control-transfer helpers every chip driver is built
//! from. Chip drivers embed it and delegate the common plumbing.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::driver::InterfaceInfo;
use crate::error::{Error, Result};
use crate::usb::{BulkIn, BulkOut, UsbDevice, UsbInterface};

/// bmRequestType for vendor OUT requests addressed to the device.
const VENDOR_OUT: u8 = 0x40;
/// bmRequestType for vendor IN requests addressed to the device.
const VENDOR_IN: u8 = 0xc0;

/// Default control transfer timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Common driver state: device handle, claimed interface, endpoint layout.
pub(crate) struct GenericDriver {
    #[allow(dead_code)] // Kept to ensure the USB device stays open
    device: Arc<dyn UsbDevice>,
    interface: Box<dyn UsbInterface>,
    info: InterfaceInfo,
    ifcnum: u8,
    timeout: Duration,
}

impl GenericDriver {
    /// Claim `ifcnum` on `device`. Claim failures arrive already mapped to
    /// the taxonomy (`NoDevice`, `NoInterface`, `InterfaceBusy`,
    /// `NoAccess`, `UsbError`) by the transport layer.
    pub fn claim(device: Arc<dyn UsbDevice>, info: InterfaceInfo, ifcnum: u8) -> Result<Self> {
        let interface = device.claim_interface(ifcnum).inspect_err(|err| {
            error!("claim interface {ifcnum} failed: {err}");
        })?;
        Ok(Self {
            device,
            interface,
            info,
            ifcnum,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    pub fn ifcnum(&self) -> u8 {
        self.ifcnum
    }

    pub fn open_endpoints(&self) -> Result<(Box<dyn BulkIn>, Box<dyn BulkOut>)> {
        let bulk_in = self.interface.open_bulk_in(self.info.ep_bulk_in)?;
        let bulk_out = self.interface.open_bulk_out(self.info.ep_bulk_out)?;
        Ok((bulk_in, bulk_out))
    }

    /// Vendor OUT request with no data stage.
    pub fn write_cv(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.interface
            .control_out(VENDOR_OUT, request, value, index, &[], self.timeout)
            .inspect_err(|_| {
                error!(
                    "control transfer {VENDOR_OUT:02x},{request:02x},{value:04x},{index:04x} failed"
                );
            })
            .map_err(|_| Error::Control)
    }

    /// Vendor IN request reading one byte.
    pub fn read_cv_u8(&self, request: u8, value: u16) -> Result<u8> {
        let data = self
            .interface
            .control_in(VENDOR_IN, request, value, 0, 1, self.timeout)
            .map_err(|_| Error::Control)?;
        if data.len() != 1 {
            error!("control transfer {VENDOR_IN:02x},{request:02x},{value:04x} short read");
            return Err(Error::Control);
        }
        Ok(data[0])
    }

    /// Raw control transfer with an explicit bmRequestType; direction is
    /// taken from bit 7. Used for class-specific requests.
    pub fn control_out(&self, request_type: u8, request: u8, data: &[u8]) -> Result<()> {
        self.interface
            .control_out(request_type, request, 0, 0, data, self.timeout)
            .inspect_err(|_| {
                error!("control transfer {request_type:02x},{request:02x} failed");
            })
            .map_err(|_| Error::Control)
    }

    /// Raw IN control transfer with an explicit bmRequestType.
    pub fn control_in(&self, request_type: u8, request: u8, length: u16) -> Result<Vec<u8>> {
        let data = self
            .interface
            .control_in(request_type, request, 0, 0, length, self.timeout)
            .map_err(|_| Error::Control)?;
        if data.len() != length as usize {
            error!("control transfer {request_type:02x},{request:02x} short read");
            return Err(Error::Control);
        }
        Ok(data)
    }
}
