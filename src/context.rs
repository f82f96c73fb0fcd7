//! The bridge context: device lookup, channel lifecycle, and the unified
//! event pump.
//!
//! [`Context`] owns every live channel. The pump interleaves one bounded
//! `poll` over the descriptors channels asked to wait on with a drain of
//! each channel's bulk completions, then runs the pipe pumps for whatever
//! became ready. Channels are never freed inline: removal goes through a
//! delete list and a channel is reaped only once every outstanding
//! transfer has resolved.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tracing::{error, info};

use crate::channel::{fd, pipe_pair, FileChannel, Readiness};
use crate::driver::create_driver;
use crate::error::{Error, Result};
use crate::types::{Channel, DeviceSelector, Protocol, Status};
use crate::usb::host::HostBus;
use crate::usb::{UsbBus, UsbDeviceInfo};

type ChannelRef = Arc<Mutex<FileChannel>>;

/// A USB-UART bridge instance.
///
/// The pump ([`Context::pump`]) is single-threaded cooperative: the caller
/// owns the thread that drives it. Every other operation may be called
/// concurrently from other threads.
pub struct Context {
    bus: Arc<dyn UsbBus>,
    /// Live channels. The pump holds this shared and upgrades only to
    /// move entries out; attach/close take it exclusively.
    channels: RwLock<Vec<ChannelRef>>,
    /// Channels scheduled for removal, kept until their transfers drain.
    delete_list: Mutex<Vec<ChannelRef>>,
    /// Pipe descriptors became ready; the channel pumps must run.
    pending: AtomicBool,
}

impl Context {
    /// A context over the host's USB bus.
    pub fn new() -> Self {
        Self::with_bus(Arc::new(HostBus::new()))
    }

    /// A context over an arbitrary bus implementation. The test-suite
    /// plugs the in-memory [`FakeBus`](crate::usb::fake::FakeBus) in here.
    pub fn with_bus(bus: Arc<dyn UsbBus>) -> Self {
        Self {
            bus,
            channels: RwLock::new(Vec::new()),
            delete_list: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
        }
    }

    /// Bridge an existing descriptor pair to the selected device. The
    /// bridge reads bytes-to-transmit from `ch.fd_read` and writes
    /// received bytes into `ch.fd_write`.
    pub fn attach(&self, selector: DeviceSelector, ch: Channel, proto: &Protocol) -> Result<()> {
        report("attach", self.do_attach(selector, Some(ch), proto).map(|_| ()))
    }

    /// Create two pipes, bridge their near ends to the selected device,
    /// and return the application-facing pair. The returned descriptors
    /// belong to the caller; close them when done with the channel.
    pub fn pipe(&self, selector: DeviceSelector, proto: &Protocol) -> Result<Channel> {
        report("pipe", self.do_attach(selector, None, proto))
    }

    /// Detach a channel. Its transfers are cancelled and the channel is
    /// reaped by a later pump once they have drained. Closing an unknown
    /// or already-closed channel is a no-op.
    pub fn close(&self, ch: Channel) {
        let mut list = self.channels.write();
        if let Some(idx) = list.iter().position(|entry| entry.lock().matches(&ch)) {
            let entry = list.remove(idx);
            entry.lock().close();
            self.delete_list.lock().push(entry);
        }
    }

    /// The channel's status bits. Channels awaiting removal still report
    /// their bits; reaped channels yield [`Error::NoChannel`].
    pub fn status(&self, ch: Channel) -> Result<Status> {
        let entry = self.find(&ch).ok_or(Error::NoChannel)?;
        let status = entry.lock().status();
        Ok(status)
    }

    /// Reset the device behind the channel.
    pub fn reset(&self, ch: Channel) -> Result<()> {
        let entry = self.find(&ch).ok_or(Error::NoChannel)?;
        let result = entry.lock().reset();
        report("reset", result)
    }

    /// Send an RS-232 break on the channel.
    pub fn sendbreak(&self, ch: Channel) -> Result<()> {
        let entry = self.find(&ch).ok_or(Error::NoChannel)?;
        let result = entry.lock().sendbreak();
        report("sendbreak", result)
    }

    /// Run one iteration of the event pump, waiting up to `timeout_ms`
    /// (negative means no wait). Returns the number of events handled, or
    /// [`Error::NoChannels`] when the pump is idle and nothing is
    /// attached.
    pub fn pump(&self, timeout_ms: i32) -> Result<usize> {
        let timeout_ms = timeout_ms.max(0);
        let mut events = 0usize;

        // Poll the descriptors the channels asked to wait on.
        let wants = self.collect_wants();
        if !wants.is_empty() {
            events += self.poll_pipes(&wants, timeout_ms)?;
        }

        // Drain bulk completions. When there was nothing to poll, the
        // first channel's IN queue absorbs the timeout as the bounded
        // blocking point.
        {
            let list = self.channels.read();
            let mut wait = if wants.is_empty() && !list.is_empty() {
                Duration::from_millis(timeout_ms as u64)
            } else {
                Duration::ZERO
            };
            for entry in list.iter() {
                events += entry.lock().service_usb(wait);
                wait = Duration::ZERO;
            }
        }

        // Run the pipe pumps for channels whose descriptors became ready.
        if self.pending.swap(false, Ordering::Relaxed) {
            let list = self.channels.read();
            for entry in list.iter() {
                entry.lock().events();
            }
        }

        self.reap();

        if events == 0 && self.channels.read().is_empty() {
            return Err(Error::NoChannels);
        }
        Ok(events)
    }

    /// Locate a device on the bus. First match wins.
    fn find_device(&self, selector: &DeviceSelector) -> Result<Box<dyn UsbDeviceInfo>> {
        let devices = self.bus.devices()?;
        for device in devices {
            let matched = match *selector {
                DeviceSelector::BusDev { bus, dev, .. } => {
                    device.bus_number() == bus && device.address() == dev
                }
                DeviceSelector::VidPid { vid, pid, .. } => {
                    device.vendor_id() == vid && device.product_id() == pid
                }
            };
            if matched {
                info!("found {:03}/{:03}", device.bus_number(), device.address());
                return Ok(device);
            }
        }
        Err(Error::NoDevice)
    }

    /// Shared attach/pipe path. `ch` is `None` for pipe mode. Every step
    /// is transactional: a failure unwinds the device handle, the
    /// interface claim and any pipes created so far.
    fn do_attach(
        &self,
        selector: DeviceSelector,
        ch: Option<Channel>,
        proto: &Protocol,
    ) -> Result<Channel> {
        validate_protocol(proto)?;
        if let Some(ch) = &ch {
            validate_channel(ch)?;
        }

        let device = self.find_device(&selector)?.open()?;
        let driver = create_driver(&device, selector.interface())?;
        driver.setup(proto)?;

        let (internal, user, owned) = match ch {
            Some(ch) => (ch, ch, Vec::new()),
            None => pipe_pair()?,
        };
        let mut channel = FileChannel::new(driver, internal, user, owned)?;
        channel.init();
        info!("channel {{{},{}}}", user.fd_read, user.fd_write);

        self.channels.write().push(Arc::new(Mutex::new(channel)));
        Ok(user)
    }

    fn find(&self, ch: &Channel) -> Option<ChannelRef> {
        for entry in self.channels.read().iter() {
            if entry.lock().matches(ch) {
                return Some(entry.clone());
            }
        }
        for entry in self.delete_list.lock().iter() {
            if entry.lock().matches(ch) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Snapshot the one-shot poll wants of every live channel.
    fn collect_wants(&self) -> Vec<(RawFd, bool, ChannelRef)> {
        let list = self.channels.read();
        let mut wants = Vec::new();
        for entry in list.iter() {
            let (want_in, want_out) = entry.lock().poll_wants();
            if let Some(raw) = want_in {
                wants.push((raw, true, entry.clone()));
            }
            if let Some(raw) = want_out {
                wants.push((raw, false, entry.clone()));
            }
        }
        wants
    }

    /// One bounded `poll` over the wanted descriptors, dispatching
    /// readiness back to the owning channels.
    fn poll_pipes(&self, wants: &[(RawFd, bool, ChannelRef)], timeout_ms: i32) -> Result<usize> {
        let mut pollfds: Vec<PollFd> = wants
            .iter()
            .map(|&(raw, read_side, _)| {
                let flags = if read_side {
                    PollFlags::POLLIN | PollFlags::POLLHUP
                } else {
                    PollFlags::POLLOUT | PollFlags::POLLHUP
                };
                PollFd::new(fd(raw), flags)
            })
            .collect();

        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            // Interrupted polls are retried on the next pump.
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(0),
            Err(Errno::EINVAL) => {
                return Err(Error::Poll(std::io::Error::from_raw_os_error(
                    Errno::EINVAL as i32,
                )))
            }
            Err(errno) => {
                return Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32)))
            }
        }

        let mut dispatched = 0;
        for (pollfd, (_, read_side, entry)) in pollfds.iter().zip(wants) {
            let Some(revents) = pollfd.revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            let readiness = Readiness {
                readable: revents.contains(PollFlags::POLLIN),
                writable: revents.contains(PollFlags::POLLOUT),
                hangup: revents
                    .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL),
            };
            entry.lock().set_events(readiness, *read_side);
            self.pending.store(true, Ordering::Relaxed);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Deferred deletion: drain cancellations for delete-listed channels,
    /// reap the idle ones, then move channels that went defunct during
    /// this pump onto the delete list. The move happens after the reap
    /// pass so a hangup observed this pump stays visible (and its status
    /// readable) until the next one.
    fn reap(&self) {
        let has_defunct = {
            let list = self.channels.read();
            list.iter().any(|entry| entry.lock().defunct())
        };
        if !has_defunct && self.delete_list.lock().is_empty() {
            return;
        }

        let list = self.channels.upgradable_read();
        {
            let mut deletes = self.delete_list.lock();
            for entry in deletes.iter() {
                entry.lock().service_usb(Duration::ZERO);
            }
            deletes.retain(|entry| {
                let busy = entry.lock().busy();
                if busy {
                    info!("busy channel skips cleanup");
                }
                busy
            });
        }

        if has_defunct {
            let mut list = RwLockUpgradableReadGuard::upgrade(list);
            let mut deletes = self.delete_list.lock();
            let mut i = 0;
            while i < list.len() {
                if list[i].lock().defunct() {
                    deletes.push(list.remove(i));
                } else {
                    i += 1;
                }
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        {
            let mut list = self.channels.write();
            let mut deletes = self.delete_list.lock();
            while let Some(entry) = list.pop() {
                entry.lock().close();
                deletes.push(entry);
            }
        }
        // Bounded drain: give cancellations a few rounds with growing
        // timeouts before the bus goes away.
        for round in 1..=5u64 {
            let mut deletes = self.delete_list.lock();
            if deletes.is_empty() {
                break;
            }
            for entry in deletes.iter() {
                entry
                    .lock()
                    .service_usb(Duration::from_millis(100 * round));
            }
            deletes.retain(|entry| entry.lock().busy());
        }
    }
}

/// Log a failed operation the way the facade reports them: expected
/// discovery misses at info level, everything else at error level.
fn report<T>(op: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        match err {
            Error::NoDevice => info!("{op}: {err}"),
            _ => error!("{op}: error {} ({err})", err.code() as i32),
        }
    }
    result
}

fn validate_protocol(proto: &Protocol) -> Result<()> {
    if proto.baudrate == 0 {
        error!("invalid parameter baudrate");
        return Err(Error::InvalidParam("baudrate"));
    }
    Ok(())
}

/// Check that the descriptors exist and point the right way: the bridge
/// reads from `fd_read` and writes to `fd_write`.
fn validate_channel(ch: &Channel) -> Result<()> {
    if access_mode(ch.fd_read).map_or(true, |mode| mode == OFlag::O_WRONLY) {
        error!("invalid parameter fd_read");
        return Err(Error::InvalidParam("fd_read"));
    }
    if access_mode(ch.fd_write).map_or(true, |mode| mode == OFlag::O_RDONLY) {
        error!("invalid parameter fd_write");
        return Err(Error::InvalidParam("fd_write"));
    }
    Ok(())
}

fn access_mode(raw: RawFd) -> Option<OFlag> {
    let flags = fcntl(fd(raw), FcntlArg::F_GETFL).ok()?;
    Some(OFlag::from_bits_retain(flags) & OFlag::O_ACCMODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PROTO_115200_8N1, PROTO_19200_8N1};
    use crate::usb::fake::{FakeBus, FakeDevice};

    fn ch34x_bus() -> (Arc<FakeBus>, Arc<FakeDevice>) {
        let bus = Arc::new(FakeBus::new());
        let dev = FakeDevice::loopback(0x1a86, 0x7523);
        bus.plug(dev.clone());
        (bus, dev)
    }

    fn ch34x_selector() -> DeviceSelector {
        DeviceSelector::VidPid { vid: 0x1a86, pid: 0x7523, ifc: 0 }
    }

    #[test]
    fn pump_without_channels_reports_no_channels() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        assert!(matches!(ctx.pump(0), Err(Error::NoChannels)));
    }

    #[test]
    fn attach_rejects_zero_baudrate() {
        let (bus, dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let mut proto = PROTO_115200_8N1;
        proto.baudrate = 0;
        let err = ctx.pipe(ch34x_selector(), &proto).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
        // Nothing reached the device.
        assert!(dev.controls().is_empty());
    }

    #[test]
    fn attach_rejects_bad_descriptors() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let err = ctx
            .attach(
                ch34x_selector(),
                Channel { fd_read: -1, fd_write: -1 },
                &PROTO_115200_8N1,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn attach_checks_descriptor_direction() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        // Swapped on purpose: the read end cannot be written and vice
        // versa.
        let err = ctx
            .attach(
                ch34x_selector(),
                Channel {
                    fd_read: write_end.as_raw_fd(),
                    fd_write: read_end.as_raw_fd(),
                },
                &PROTO_115200_8N1,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn unknown_device_is_no_device() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let err = ctx
            .pipe(
                DeviceSelector::VidPid { vid: 0xffff, pid: 0x0001, ifc: 0 },
                &PROTO_115200_8N1,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoDevice));
    }

    #[test]
    fn selector_by_bus_address() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        // The fake loopback sits at 001/002.
        let ch = ctx
            .pipe(
                DeviceSelector::BusDev { bus: 1, dev: 2, ifc: 0 },
                &PROTO_19200_8N1,
            )
            .unwrap();
        assert!(ctx.status(ch).unwrap().is_all_ok());
    }

    #[test]
    fn bad_baudrate_leaves_no_state_behind() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let mut proto = PROTO_115200_8N1;
        proto.baudrate = 50;
        let err = ctx.pipe(ch34x_selector(), &proto).unwrap_err();
        assert!(matches!(err, Error::BadBaudrate(50)));
        assert!(ctx.channels.read().is_empty());
        assert!(ctx.delete_list.lock().is_empty());
        // The claim was rolled back: a new attach succeeds.
        assert!(ctx.pipe(ch34x_selector(), &PROTO_115200_8N1).is_ok());
    }

    #[test]
    fn close_is_idempotent_and_silent_on_unknown() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let ch = ctx.pipe(ch34x_selector(), &PROTO_115200_8N1).unwrap();
        ctx.close(ch);
        ctx.close(ch);
        ctx.close(Channel { fd_read: 999, fd_write: 998 });
    }

    #[test]
    fn status_of_unknown_channel() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let err = ctx
            .status(Channel { fd_read: 42, fd_write: 43 })
            .unwrap_err();
        assert!(matches!(err, Error::NoChannel));
        assert_eq!(err.code().negative(), -4);
    }

    #[test]
    fn sendbreak_not_implemented_on_ch34x() {
        let (bus, _dev) = ch34x_bus();
        let ctx = Context::with_bus(bus);
        let ch = ctx.pipe(ch34x_selector(), &PROTO_115200_8N1).unwrap();
        assert!(matches!(ctx.sendbreak(ch), Err(Error::NotImplemented)));
        assert!(ctx.reset(ch).is_ok());
    }
}
