//! USB transport abstraction.
//!
//! The engine talks to the bus through this narrow trait surface so that
//! the real [`nusb`]-backed transport ([`host::HostBus`]) and the in-memory
//! loopback bus used by the test-suite ([`fake::FakeBus`]) are
//! interchangeable. The surface mirrors the endpoint-queue model: bulk
//! transfers are submitted to a per-endpoint queue and completions are
//! reaped in submission order.

pub mod fake;
pub mod host;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Fields of the USB device descriptor the drivers classify on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    /// idVendor.
    pub vendor_id: u16,
    /// idProduct.
    pub product_id: u16,
    /// bcdDevice, the device release number.
    pub bcd_device: u16,
    /// bDeviceClass.
    pub class: u8,
    /// bMaxPacketSize0.
    pub max_packet_size_0: u8,
    /// Bus number the device is attached to.
    pub bus_number: u8,
    /// Device address on that bus.
    pub address: u8,
}

/// Outcome of a bulk transfer, the input to the completion classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer completed (possibly short).
    Completed,
    /// The transfer timed out; treated like a short completion.
    TimedOut,
    /// The transfer was cancelled.
    Cancelled,
    /// The device is gone.
    NoDevice,
    /// The endpoint stalled.
    Stall,
    /// The device sent more data than requested.
    Overflow,
    /// Any other transfer failure.
    Error,
}

impl TransferStatus {
    /// Whether the data path should run for this completion.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }

    /// Whether the failure is severe enough to log at error level
    /// (cancellation and detach are expected shutdown traffic).
    pub fn is_severe(self) -> bool {
        matches!(self, Self::Stall | Self::Overflow | Self::Error)
    }
}

/// A reaped bulk transfer.
#[derive(Debug)]
pub struct Completion {
    /// How the transfer ended.
    pub status: TransferStatus,
    /// IN: the received payload (`data.len() == actual`). OUT: the buffer
    /// that was submitted, returned for partial-write handling.
    pub data: Vec<u8>,
    /// Bytes actually transferred on the wire.
    pub actual: usize,
}

/// Device enumeration.
pub trait UsbBus: Send + Sync {
    /// Snapshot of the devices currently on the bus.
    fn devices(&self) -> Result<Vec<Box<dyn UsbDeviceInfo>>>;
}

/// An enumerated, not yet opened device.
pub trait UsbDeviceInfo: Send {
    /// idVendor.
    fn vendor_id(&self) -> u16;
    /// idProduct.
    fn product_id(&self) -> u16;
    /// Bus number.
    fn bus_number(&self) -> u8;
    /// Device address on the bus.
    fn address(&self) -> u8;
    /// Open the device.
    fn open(&self) -> Result<Arc<dyn UsbDevice>>;
}

/// An opened device handle.
pub trait UsbDevice: Send + Sync {
    /// The descriptor fields used for chip classification.
    fn descriptor(&self) -> DeviceDesc;

    /// Claim an interface. The claim is released when the returned handle
    /// is dropped.
    fn claim_interface(&self, number: u8) -> Result<Box<dyn UsbInterface>>;
}

/// A claimed interface: control transfers plus bulk endpoint access.
pub trait UsbInterface: Send {
    /// Issue an OUT control transfer. `request_type` is the raw
    /// bmRequestType byte (direction bit ignored).
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Issue an IN control transfer of up to `length` bytes.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>>;

    /// Open the bulk IN endpoint with the given address (bit 7 set).
    fn open_bulk_in(&self, endpoint: u8) -> Result<Box<dyn BulkIn>>;

    /// Open the bulk OUT endpoint with the given address (bit 7 clear).
    fn open_bulk_out(&self, endpoint: u8) -> Result<Box<dyn BulkOut>>;
}

/// A bulk IN endpoint queue.
///
/// Completions are reaped in submission order; a submitted transfer stays
/// pending until it is reaped, even after cancellation.
pub trait BulkIn: Send {
    /// Queue a read of up to `len` bytes.
    fn submit(&mut self, len: usize);
    /// Reap the next completion, waiting up to `timeout`. A zero timeout
    /// polls without blocking.
    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion>;
    /// Request cancellation of every pending transfer. Cancelled transfers
    /// still complete (with [`TransferStatus::Cancelled`]) and must be
    /// reaped.
    fn cancel_all(&mut self);
    /// Number of submitted transfers not yet reaped.
    fn pending(&self) -> usize;
}

/// A bulk OUT endpoint queue. Same contract as [`BulkIn`].
pub trait BulkOut: Send {
    /// Queue `data` for transmission.
    fn submit(&mut self, data: Vec<u8>);
    /// Reap the next completion, waiting up to `timeout`.
    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion>;
    /// Request cancellation of every pending transfer.
    fn cancel_all(&mut self);
    /// Number of submitted transfers not yet reaped.
    fn pending(&self) -> usize;
}
