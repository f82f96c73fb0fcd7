//! In-memory USB bus used by the test-suite.
//!
//! [`FakeBus`] hosts [`FakeDevice`]s that answer control transfers, echo
//! bulk OUT traffic into their bulk IN FIFO (loopback), and can be
//! disconnected mid-flight to exercise the detach paths. Transfer
//! completion order and the pending/cancel semantics follow the contract
//! documented on [`BulkIn`](super::BulkIn) / [`BulkOut`](super::BulkOut).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

use super::{BulkIn, BulkOut, Completion, DeviceDesc, TransferStatus, UsbBus, UsbDevice,
            UsbDeviceInfo, UsbInterface};

/// A recorded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// Raw bmRequestType byte (direction bit cleared).
    pub request_type: u8,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// OUT payload, empty for IN requests.
    pub data: Vec<u8>,
}

#[derive(Default)]
struct DeviceState {
    connected: bool,
    claimed: Vec<u8>,
    controls: Vec<ControlRecord>,
    /// Bytes the device has ready for the host.
    in_fifo: VecDeque<u8>,
    /// Submitted IN transfer lengths, oldest first.
    in_queue: VecDeque<usize>,
    in_done: VecDeque<Completion>,
    out_done: VecDeque<Completion>,
    out_pending: usize,
    /// Bytes received from the host when loopback is off.
    out_sink: Vec<u8>,
    loopback: bool,
    /// Fail every control transfer (exercises probe error paths).
    control_fail: bool,
    /// Cap on how much of an OUT transfer is accepted at once.
    out_limit: Option<usize>,
    /// Prepended to every IN completion (FTDI-style status header).
    read_header: Vec<u8>,
}

/// A scriptable USB device.
pub struct FakeDevice {
    desc: DeviceDesc,
    state: Mutex<DeviceState>,
    cond: Condvar,
}

impl FakeDevice {
    /// A device that echoes everything written to its bulk OUT endpoint
    /// back out of its bulk IN endpoint.
    pub fn loopback(vendor_id: u16, product_id: u16) -> Arc<Self> {
        let dev = Self::with_descriptor(DeviceDesc {
            vendor_id,
            product_id,
            bcd_device: 0x0100,
            class: 0x00,
            max_packet_size_0: 8,
            bus_number: 1,
            address: 2,
        });
        dev.state.lock().loopback = true;
        dev
    }

    /// A device with full control over the descriptor. Not in loopback
    /// mode: OUT bytes accumulate for [`take_output`](Self::take_output).
    pub fn with_descriptor(desc: DeviceDesc) -> Arc<Self> {
        Arc::new(Self {
            desc,
            state: Mutex::new(DeviceState {
                connected: true,
                ..DeviceState::default()
            }),
            cond: Condvar::new(),
        })
    }

    /// Every control transfer seen so far, in order.
    pub fn controls(&self) -> Vec<ControlRecord> {
        self.state.lock().controls.clone()
    }

    /// Unplug the device: all pending and future transfers complete with
    /// [`TransferStatus::NoDevice`].
    pub fn disconnect(&self) {
        let mut st = self.state.lock();
        st.connected = false;
        while st.in_queue.pop_front().is_some() {
            st.in_done.push_back(gone());
        }
        while st.out_pending > 0 {
            st.out_pending -= 1;
            st.out_done.push_back(gone());
        }
        self.cond.notify_all();
    }

    /// Queue device-originated bytes for the host.
    pub fn push_input(&self, data: &[u8]) {
        let mut st = self.state.lock();
        st.in_fifo.extend(data.iter().copied());
        Self::fill_reads(&mut st);
        self.cond.notify_all();
    }

    /// Bytes received on the bulk OUT endpoint while loopback is off.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().out_sink)
    }

    /// Make every control transfer fail from now on.
    pub fn fail_controls(&self) {
        self.state.lock().control_fail = true;
    }

    /// Accept at most `limit` bytes per OUT transfer (forces partial
    /// completions).
    pub fn set_out_limit(&self, limit: usize) {
        self.state.lock().out_limit = Some(limit);
    }

    /// Prepend `header` to every IN completion, the way FTDI parts prepend
    /// their two status bytes.
    pub fn set_read_header(&self, header: Vec<u8>) {
        self.state.lock().read_header = header;
    }

    /// Satisfy queued IN transfers from the FIFO. A transfer completes as
    /// soon as any payload (or a bare header) is available for it.
    fn fill_reads(st: &mut DeviceState) {
        while let Some(&len) = st.in_queue.front() {
            if st.in_fifo.is_empty() {
                break;
            }
            st.in_queue.pop_front();
            let mut data = st.read_header.clone();
            data.truncate(len);
            let room = len - data.len();
            let take = room.min(st.in_fifo.len());
            data.extend(st.in_fifo.drain(..take));
            let actual = data.len();
            st.in_done.push_back(Completion {
                status: TransferStatus::Completed,
                data,
                actual,
            });
        }
    }
}

fn gone() -> Completion {
    Completion {
        status: TransferStatus::NoDevice,
        data: Vec::new(),
        actual: 0,
    }
}

fn cancelled() -> Completion {
    Completion {
        status: TransferStatus::Cancelled,
        data: Vec::new(),
        actual: 0,
    }
}

/// Wait on `cond` until `pop` yields a completion or `timeout` elapses.
fn wait_done(
    dev: &FakeDevice,
    timeout: Duration,
    pop: impl Fn(&mut DeviceState) -> Option<Completion>,
) -> Option<Completion> {
    let deadline = Instant::now() + timeout;
    let mut st = dev.state.lock();
    loop {
        if let Some(c) = pop(&mut st) {
            return Some(c);
        }
        if Instant::now() >= deadline {
            return None;
        }
        if dev.cond.wait_until(&mut st, deadline).timed_out() {
            return pop(&mut st);
        }
    }
}

/// An in-memory bus holding fake devices.
#[derive(Default)]
pub struct FakeBus {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
}

impl FakeBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device into the bus.
    pub fn plug(&self, device: Arc<FakeDevice>) {
        self.devices.lock().push(device);
    }
}

impl UsbBus for FakeBus {
    fn devices(&self) -> Result<Vec<Box<dyn UsbDeviceInfo>>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|dev| Box::new(FakeDeviceInfo { dev: dev.clone() }) as Box<dyn UsbDeviceInfo>)
            .collect())
    }
}

struct FakeDeviceInfo {
    dev: Arc<FakeDevice>,
}

impl UsbDeviceInfo for FakeDeviceInfo {
    fn vendor_id(&self) -> u16 {
        self.dev.desc.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.dev.desc.product_id
    }

    fn bus_number(&self) -> u8 {
        self.dev.desc.bus_number
    }

    fn address(&self) -> u8 {
        self.dev.desc.address
    }

    fn open(&self) -> Result<Arc<dyn UsbDevice>> {
        if !self.dev.state.lock().connected {
            return Err(Error::NoDevice);
        }
        Ok(Arc::new(FakeHandle { dev: self.dev.clone() }))
    }
}

struct FakeHandle {
    dev: Arc<FakeDevice>,
}

impl UsbDevice for FakeHandle {
    fn descriptor(&self) -> DeviceDesc {
        self.dev.desc
    }

    fn claim_interface(&self, number: u8) -> Result<Box<dyn UsbInterface>> {
        let mut st = self.dev.state.lock();
        if !st.connected {
            return Err(Error::NoDevice);
        }
        if st.claimed.contains(&number) {
            return Err(Error::InterfaceBusy);
        }
        st.claimed.push(number);
        Ok(Box::new(FakeInterface {
            dev: self.dev.clone(),
            number,
        }))
    }
}

struct FakeInterface {
    dev: Arc<FakeDevice>,
    number: u8,
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.dev.state.lock().claimed.retain(|&n| n != self.number);
    }
}

impl UsbInterface for FakeInterface {
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        let mut st = self.dev.state.lock();
        if !st.connected || st.control_fail {
            return Err(Error::Control);
        }
        st.controls.push(ControlRecord {
            request_type: request_type & 0x7f,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut st = self.dev.state.lock();
        if !st.connected || st.control_fail {
            return Err(Error::Control);
        }
        st.controls.push(ControlRecord {
            request_type: request_type & 0x7f,
            request,
            value,
            index,
            data: Vec::new(),
        });
        Ok(vec![0u8; length as usize])
    }

    fn open_bulk_in(&self, _endpoint: u8) -> Result<Box<dyn BulkIn>> {
        Ok(Box::new(FakeBulkIn { dev: self.dev.clone() }))
    }

    fn open_bulk_out(&self, _endpoint: u8) -> Result<Box<dyn BulkOut>> {
        Ok(Box::new(FakeBulkOut { dev: self.dev.clone() }))
    }
}

struct FakeBulkIn {
    dev: Arc<FakeDevice>,
}

impl BulkIn for FakeBulkIn {
    fn submit(&mut self, len: usize) {
        let mut st = self.dev.state.lock();
        if !st.connected {
            st.in_done.push_back(gone());
        } else {
            st.in_queue.push_back(len);
            FakeDevice::fill_reads(&mut st);
        }
        self.dev.cond.notify_all();
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        wait_done(&self.dev, timeout, |st| st.in_done.pop_front())
    }

    fn cancel_all(&mut self) {
        let mut st = self.dev.state.lock();
        while st.in_queue.pop_front().is_some() {
            st.in_done.push_back(cancelled());
        }
        self.dev.cond.notify_all();
    }

    fn pending(&self) -> usize {
        let st = self.dev.state.lock();
        st.in_queue.len() + st.in_done.len()
    }
}

struct FakeBulkOut {
    dev: Arc<FakeDevice>,
}

impl BulkOut for FakeBulkOut {
    fn submit(&mut self, data: Vec<u8>) {
        let mut st = self.dev.state.lock();
        if !st.connected {
            st.out_done.push_back(gone());
            self.dev.cond.notify_all();
            return;
        }
        let actual = match st.out_limit {
            Some(limit) => limit.min(data.len()),
            None => data.len(),
        };
        if st.loopback {
            let accepted: Vec<u8> = data[..actual].to_vec();
            st.in_fifo.extend(accepted);
        } else {
            st.out_sink.extend_from_slice(&data[..actual]);
        }
        st.out_done.push_back(Completion {
            status: TransferStatus::Completed,
            data,
            actual,
        });
        FakeDevice::fill_reads(&mut st);
        self.dev.cond.notify_all();
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        wait_done(&self.dev, timeout, |st| st.out_done.pop_front())
    }

    fn cancel_all(&mut self) {
        // OUT transfers complete synchronously in this fake; nothing can be
        // in flight here.
    }

    fn pending(&self) -> usize {
        let st = self.dev.state.lock();
        st.out_pending + st.out_done.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(dev: &Arc<FakeDevice>) -> (Box<dyn BulkIn>, Box<dyn BulkOut>) {
        let handle = FakeHandle { dev: dev.clone() };
        let ifc = handle.claim_interface(0).unwrap();
        (ifc.open_bulk_in(0x82).unwrap(), ifc.open_bulk_out(0x02).unwrap())
    }

    #[test]
    fn loopback_echoes() {
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        let (mut bin, mut bout) = endpoints(&dev);

        bin.submit(256);
        assert!(bin.wait_complete(Duration::ZERO).is_none());

        bout.submit(b"abc".to_vec());
        let out = bout.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(out.status, TransferStatus::Completed);
        assert_eq!(out.actual, 3);

        let inn = bin.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(inn.data, b"abc");
        assert_eq!(bin.pending(), 0);
    }

    #[test]
    fn partial_out_completions() {
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        dev.set_out_limit(2);
        let (_bin, mut bout) = endpoints(&dev);

        bout.submit(b"abcde".to_vec());
        let out = bout.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(out.actual, 2);
        assert_eq!(out.data, b"abcde");
    }

    #[test]
    fn header_prepended_to_reads() {
        let dev = FakeDevice::loopback(0x0403, 0x6001);
        dev.set_read_header(vec![0x01, 0x60]);
        let (mut bin, mut bout) = endpoints(&dev);

        bin.submit(64);
        bout.submit(b"xy".to_vec());
        let inn = bin.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(inn.data, &[0x01, 0x60, b'x', b'y']);
    }

    #[test]
    fn disconnect_fails_pending_and_future() {
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        let (mut bin, _bout) = endpoints(&dev);

        bin.submit(256);
        dev.disconnect();
        let c = bin.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(c.status, TransferStatus::NoDevice);

        bin.submit(256);
        let c = bin.wait_complete(Duration::ZERO).unwrap();
        assert_eq!(c.status, TransferStatus::NoDevice);
    }

    #[test]
    fn cancel_completes_as_cancelled() {
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        let (mut bin, _bout) = endpoints(&dev);

        bin.submit(256);
        bin.submit(256);
        assert_eq!(bin.pending(), 2);
        bin.cancel_all();
        assert_eq!(
            bin.wait_complete(Duration::ZERO).unwrap().status,
            TransferStatus::Cancelled
        );
        assert_eq!(
            bin.wait_complete(Duration::ZERO).unwrap().status,
            TransferStatus::Cancelled
        );
        assert_eq!(bin.pending(), 0);
    }

    #[test]
    fn second_claim_is_busy() {
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        let handle = FakeHandle { dev: dev.clone() };
        let first = handle.claim_interface(0).unwrap();
        assert!(matches!(
            handle.claim_interface(0),
            Err(Error::InterfaceBusy)
        ));
        drop(first);
        assert!(handle.claim_interface(0).is_ok());
    }
}
