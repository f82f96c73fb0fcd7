//! The real USB transport, backed by [`nusb`].

use std::sync::Arc;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::MaybeFuture;

use crate::error::{Error, Result};

use super::{BulkIn, BulkOut, Completion, DeviceDesc, TransferStatus, UsbBus, UsbDevice,
            UsbDeviceInfo, UsbInterface};

/// Enumerates devices through `nusb::list_devices`.
pub struct HostBus;

impl HostBus {
    /// A handle on the host's USB bus.
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBus for HostBus {
    fn devices(&self) -> Result<Vec<Box<dyn UsbDeviceInfo>>> {
        let infos = nusb::list_devices().wait()?;
        Ok(infos
            .map(|info| Box::new(HostDeviceInfo { info }) as Box<dyn UsbDeviceInfo>)
            .collect())
    }
}

struct HostDeviceInfo {
    info: nusb::DeviceInfo,
}

impl UsbDeviceInfo for HostDeviceInfo {
    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    fn bus_number(&self) -> u8 {
        self.info.busnum()
    }

    fn address(&self) -> u8 {
        self.info.device_address()
    }

    fn open(&self) -> Result<Arc<dyn UsbDevice>> {
        let device = self.info.open().wait()?;
        let desc = device.device_descriptor();
        let desc = DeviceDesc {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bcd_device: desc.device_version(),
            class: desc.class(),
            max_packet_size_0: desc.max_packet_size_0(),
            bus_number: self.info.busnum(),
            address: self.info.device_address(),
        };
        Ok(Arc::new(HostDevice { device, desc }))
    }
}

struct HostDevice {
    device: nusb::Device,
    desc: DeviceDesc,
}

impl UsbDevice for HostDevice {
    fn descriptor(&self) -> DeviceDesc {
        self.desc
    }

    fn claim_interface(&self, number: u8) -> Result<Box<dyn UsbInterface>> {
        let interface = self
            .device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(claim_error)?;
        Ok(Box::new(HostInterface { interface }))
    }
}

/// Map a claim failure into the error taxonomy the way the generic driver
/// base expects it.
fn claim_error(err: nusb::Error) -> Error {
    use nusb::ErrorKind;
    match err.kind() {
        ErrorKind::Disconnected => Error::NoDevice,
        ErrorKind::NotFound => Error::NoInterface,
        ErrorKind::Busy => Error::InterfaceBusy,
        ErrorKind::PermissionDenied => Error::NoAccess,
        _ => Error::Usb,
    }
}

struct HostInterface {
    interface: nusb::Interface,
}

/// Split a raw bmRequestType byte into the nusb control classification.
fn control_parts(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x3 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1f {
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Device,
    };
    (control_type, recipient)
}

impl UsbInterface for HostInterface {
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let (control_type, recipient) = control_parts(request_type);
        self.interface
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|_| Error::Control)?;
        Ok(())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (control_type, recipient) = control_parts(request_type);
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|_| Error::Control)?;
        Ok(data)
    }

    fn open_bulk_in(&self, endpoint: u8) -> Result<Box<dyn BulkIn>> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|_| Error::Usb)?;
        Ok(Box::new(HostBulkIn { ep }))
    }

    fn open_bulk_out(&self, endpoint: u8) -> Result<Box<dyn BulkOut>> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|_| Error::Usb)?;
        Ok(Box::new(HostBulkOut { ep }))
    }
}

/// Map a transfer outcome onto the classifier statuses.
fn transfer_status(status: std::result::Result<(), nusb::transfer::TransferError>) -> TransferStatus {
    use nusb::transfer::TransferError;
    match status {
        Ok(()) => TransferStatus::Completed,
        Err(TransferError::Cancelled) => TransferStatus::Cancelled,
        Err(TransferError::Disconnected) => TransferStatus::NoDevice,
        Err(TransferError::Stall) => TransferStatus::Stall,
        Err(_) => TransferStatus::Error,
    }
}

struct HostBulkIn {
    ep: nusb::Endpoint<Bulk, In>,
}

impl BulkIn for HostBulkIn {
    fn submit(&mut self, len: usize) {
        self.ep.submit(Buffer::new(len));
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        let completion = self.ep.wait_next_complete(timeout)?;
        let actual = completion.actual_len;
        let mut data = completion.buffer.into_vec();
        data.truncate(actual);
        Some(Completion {
            status: transfer_status(completion.status),
            data,
            actual,
        })
    }

    fn cancel_all(&mut self) {
        self.ep.cancel_all();
    }

    fn pending(&self) -> usize {
        self.ep.pending()
    }
}

struct HostBulkOut {
    ep: nusb::Endpoint<Bulk, Out>,
}

impl BulkOut for HostBulkOut {
    fn submit(&mut self, data: Vec<u8>) {
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(&data);
        self.ep.submit(buf);
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        let completion = self.ep.wait_next_complete(timeout)?;
        Some(Completion {
            status: transfer_status(completion.status),
            data: completion.buffer.into_vec(),
            actual: completion.actual_len,
        })
    }

    fn cancel_all(&mut self) {
        self.ep.cancel_all();
    }

    fn pending(&self) -> usize {
        self.ep.pending()
    }
}
