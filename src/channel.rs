//! The per-connection transfer state machine.
//!
//! A [`FileChannel`] couples one USB bulk endpoint pair to one file
//! descriptor pair. The bulk IN queue keeps two `chunk_size` reads
//! outstanding (double-buffering hides per-transfer latency); at most one
//! completed read is held as the *current* buffer while its payload drains
//! into `fd_write`. The bulk OUT queue carries at most one transfer, filled
//! from `fd_read`. All pipe I/O is non-blocking; a half that would block
//! posts a one-shot poll want and resumes when the event pump reports
//! readiness.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::{debug, error, info};

use crate::driver::SerialDriver;
use crate::error::{Error, Result};
use crate::types::{Channel, Status};
use crate::usb::{BulkIn, BulkOut, Completion};

/// Pipe readiness reported by the event pump for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// A completed IN transfer being drained into the write pipe.
struct CurrentRead {
    data: Vec<u8>,
    /// Bytes already delivered; `pos == data.len()` means fully drained.
    pos: usize,
}

/// One bridged connection.
pub(crate) struct FileChannel {
    driver: Box<dyn SerialDriver>,
    bulk_in: Box<dyn BulkIn>,
    bulk_out: Box<dyn BulkOut>,
    chunk: usize,

    current: Option<CurrentRead>,
    out_busy: bool,

    /// Descriptor the channel reads bytes-to-transmit from.
    fd_read: RawFd,
    /// Descriptor the channel writes received bytes into.
    fd_write: RawFd,
    /// The pair the application knows; equals the internal pair in attach
    /// mode, the far pipe ends in pipe mode.
    user: Channel,
    /// Pipe mode owns its two near pipe ends; attach mode owns nothing.
    #[allow(dead_code)] // Held so the descriptors close exactly at drop
    owned: Vec<OwnedFd>,

    pipein_ready: bool,
    pipeout_ready: bool,
    pipein_hangup: bool,
    pipeout_hangup: bool,
    device_hangup: bool,

    want_pollin: bool,
    want_pollout: bool,

    /// Removal requested; the context moves the channel to its delete list
    /// at the end of the pump.
    defunct: bool,
}

/// Create the two pipes backing a pipe-mode channel.
///
/// Returns (internal pair, user-facing pair, owned near ends). The
/// internal side reads what the application writes and vice versa. The
/// user-facing descriptors are released raw: the application owns them
/// and closes them when it is done with the channel.
pub(crate) fn pipe_pair() -> Result<(Channel, Channel, Vec<OwnedFd>)> {
    use std::os::fd::IntoRawFd;

    let (rx_read, rx_write) = nix::unistd::pipe().map_err(pipe_err)?;
    let (tx_read, tx_write) = nix::unistd::pipe().map_err(pipe_err)?;
    let internal = Channel {
        fd_read: tx_read.as_raw_fd(),
        fd_write: rx_write.as_raw_fd(),
    };
    let user = Channel {
        fd_read: rx_read.into_raw_fd(),
        fd_write: tx_write.into_raw_fd(),
    };
    Ok((internal, user, vec![rx_write, tx_read]))
}

fn pipe_err(errno: Errno) -> Error {
    Error::Pipe(std::io::Error::from_raw_os_error(errno as i32))
}

/// Borrow a descriptor the caller guarantees stays open for the call.
pub(crate) fn fd(raw: RawFd) -> BorrowedFd<'static> {
    // SAFETY: the channel (or the application, in attach mode) keeps the
    // descriptor open for the channel's lifetime.
    unsafe { BorrowedFd::borrow_raw(raw) }
}

fn set_nonblock(raw: RawFd) -> Result<()> {
    let fcntl_err =
        |errno: Errno| Error::Fcntl(std::io::Error::from_raw_os_error(errno as i32));
    let flags = fcntl(fd(raw), FcntlArg::F_GETFL).map_err(fcntl_err)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd(raw), FcntlArg::F_SETFL(flags)).map_err(fcntl_err)?;
    Ok(())
}

impl FileChannel {
    /// Build a channel over `driver`, bridging the `internal` descriptor
    /// pair. `user` is the pair the application addresses the channel by;
    /// `owned` are descriptors to close when the channel dies.
    pub fn new(
        driver: Box<dyn SerialDriver>,
        internal: Channel,
        user: Channel,
        owned: Vec<OwnedFd>,
    ) -> Result<Self> {
        let chunk = driver.info().chunk_size;
        let (bulk_in, bulk_out) = driver.open_endpoints()?;
        set_nonblock(internal.fd_read)?;
        set_nonblock(internal.fd_write)?;
        Ok(Self {
            driver,
            bulk_in,
            bulk_out,
            chunk,
            current: None,
            out_busy: false,
            fd_read: internal.fd_read,
            fd_write: internal.fd_write,
            user,
            owned,
            pipein_ready: false,
            pipeout_ready: false,
            pipein_hangup: false,
            pipeout_hangup: false,
            device_hangup: false,
            want_pollin: false,
            want_pollout: false,
            defunct: false,
        })
    }

    /// Start operations: both reads in flight, OUT path primed once.
    pub fn init(&mut self) {
        self.bulk_in.submit(self.chunk);
        self.bulk_in.submit(self.chunk);
        self.readpipe();
    }

    /// Whether `ch` addresses this channel.
    pub fn matches(&self, ch: &Channel) -> bool {
        ch.fd_read == self.user.fd_read || ch.fd_write == self.user.fd_write
    }

    pub fn status(&self) -> Status {
        Status {
            read_pipe_ok: !self.pipein_hangup,
            write_pipe_ok: !self.pipeout_hangup,
            usb_dev_ok: !self.device_hangup,
        }
    }

    pub fn reset(&self) -> Result<()> {
        self.driver.reset()
    }

    pub fn sendbreak(&self) -> Result<()> {
        self.driver.sendbreak()
    }

    /// Any transfer still owned by the backend.
    pub fn busy(&self) -> bool {
        self.bulk_in.pending() > 0 || self.bulk_out.pending() > 0
    }

    pub fn defunct(&self) -> bool {
        self.defunct
    }

    /// One-shot poll wants: (fd, watch-for-read) entries the pump should
    /// include in its next poll set.
    pub fn poll_wants(&self) -> (Option<RawFd>, Option<RawFd>) {
        (
            self.want_pollin.then_some(self.fd_read),
            self.want_pollout.then_some(self.fd_write),
        )
    }

    /// Cancel everything in flight and mark both pipe halves closed.
    /// Returns true when the channel can be dropped right away.
    pub fn close(&mut self) -> bool {
        self.cancel_transfers();
        self.pipein_hangup = true;
        self.pipeout_hangup = true;
        !self.busy()
    }

    fn cancel_transfers(&mut self) {
        self.bulk_in.cancel_all();
        self.bulk_out.cancel_all();
        // Undelivered bytes are dropped so cancellations can be reaped.
        self.current = None;
    }

    /// Record poll results for one of the two descriptors.
    pub fn set_events(&mut self, readiness: Readiness, read_side: bool) {
        if read_side {
            self.want_pollin = false;
        } else {
            self.want_pollout = false;
        }
        if readiness.readable {
            self.pipein_ready = true;
        }
        if readiness.writable {
            self.pipeout_ready = true;
        }
        if readiness.hangup {
            if read_side {
                self.pipein_hangup = true;
            } else {
                self.pipeout_hangup = true;
            }
            self.request_removal(false);
        }
    }

    /// Run the pipe pumps whose readiness was flagged since the last pass.
    pub fn events(&mut self) {
        if self.pipein_ready {
            self.pipein_ready = false;
            self.readpipe();
        }
        if self.pipeout_ready {
            self.pipeout_ready = false;
            self.writepipe();
        }
    }

    /// Reap and act on bulk completions. `wait` bounds blocking for the
    /// first IN completion; everything ready is drained without blocking.
    /// Returns the number of completions handled.
    pub fn service_usb(&mut self, wait: Duration) -> usize {
        let mut handled = 0;
        while let Some(completion) = self.bulk_out.wait_complete(Duration::ZERO) {
            handled += 1;
            self.on_out_complete(completion);
        }
        let mut budget = wait;
        // The next IN completion stays queued while a current buffer is
        // being drained; taking it early would reorder the stream.
        while self.current.is_none() {
            match self.bulk_in.wait_complete(budget) {
                Some(completion) => {
                    handled += 1;
                    budget = Duration::ZERO;
                    self.on_in_complete(completion);
                }
                None => break,
            }
        }
        handled
    }

    /// Classify a completion. Returns true when the data path should run.
    fn classify(&mut self, completion: &Completion) -> bool {
        match completion.status {
            s if s.is_data() => true,
            s if s.is_severe() => {
                error!("transfer severe error {s:?}");
                self.request_removal(true);
                false
            }
            // Cancelled / NoDevice: expected teardown traffic.
            _ => {
                self.request_removal(true);
                false
            }
        }
    }

    fn on_in_complete(&mut self, completion: Completion) {
        if !self.classify(&completion) {
            return;
        }
        let mut data = completion.data;
        let pos = self.driver.read_callback(&mut data);
        if self.pipeout_hangup {
            return;
        }
        if pos >= data.len() {
            self.resubmit_read();
        } else {
            self.current = Some(CurrentRead { data, pos });
            self.writepipe();
        }
    }

    fn resubmit_read(&mut self) {
        if !self.device_hangup {
            self.bulk_in.submit(self.chunk);
        }
    }

    fn on_out_complete(&mut self, completion: Completion) {
        self.out_busy = false;
        if !self.classify(&completion) {
            return;
        }
        let Completion { data, actual, .. } = completion;
        if actual < data.len() {
            info!("partially complete transfer {actual}/{}", data.len());
            self.out_busy = true;
            self.bulk_out.submit(data[actual..].to_vec());
        } else {
            self.driver.write_callback(&data);
            if !self.pipein_hangup {
                self.readpipe();
            }
        }
    }

    /// Move bytes from `fd_read` into a fresh OUT transfer.
    fn readpipe(&mut self) {
        if self.out_busy || self.pipein_hangup || self.defunct {
            return;
        }
        let mut buf = Vec::with_capacity(self.chunk);
        self.driver.prepare_write(&mut buf);
        let header = buf.len();
        buf.resize(self.chunk, 0);
        match nix::unistd::read(fd(self.fd_read), &mut buf[header..]) {
            Ok(0) => {
                info!("EOF");
                self.pipein_hangup = true;
                self.request_removal(false);
            }
            Ok(n) => {
                buf.truncate(header + n);
                self.out_busy = true;
                self.bulk_out.submit(buf);
            }
            Err(Errno::EAGAIN) => self.want_pollin = true,
            Err(Errno::EINTR) => {
                info!("interrupted, attempting to continue");
                self.want_pollin = true;
            }
            Err(errno) => {
                error!("i/o error {errno} on read pipe, shutting down");
                self.pipein_hangup = true;
                self.request_removal(false);
            }
        }
    }

    /// Drain the current IN buffer into `fd_write`.
    fn writepipe(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        match nix::unistd::write(fd(self.fd_write), &current.data[current.pos..]) {
            Ok(n) => {
                current.pos += n;
                if current.pos >= current.data.len() {
                    self.current = None;
                    self.resubmit_read();
                } else {
                    self.want_pollout = true;
                }
            }
            Err(Errno::EAGAIN) => self.want_pollout = true,
            Err(Errno::EINTR) => {
                info!("interrupted, attempting to continue");
                self.want_pollout = true;
            }
            Err(errno) => {
                if errno == Errno::EPIPE {
                    info!("write pipe closed by reader");
                } else {
                    error!("i/o error {errno} on write pipe, shutting down");
                }
                // Nothing can be delivered on this half any more.
                self.current = None;
                self.pipeout_hangup = true;
                self.request_removal(false);
            }
        }
    }

    /// Schedule removal once the channel cannot make progress any more:
    /// the device is gone, or both pipe halves have hung up. The status
    /// bits keep reporting which halves actually failed.
    fn request_removal(&mut self, enforce: bool) {
        self.device_hangup = self.device_hangup || enforce;
        if self.device_hangup || (self.pipein_hangup && self.pipeout_hangup) {
            self.cancel_transfers();
            if !self.defunct {
                debug!(
                    "channel {{{},{}}} scheduled for removal",
                    self.user.fd_read, self.user.fd_write
                );
            }
            self.defunct = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::create_driver;
    use crate::usb::fake::{FakeBus, FakeDevice};
    use crate::usb::UsbBus;
    use std::sync::Arc;

    /// Close a descriptor the test owns.
    fn close_fd(raw: RawFd) {
        use std::os::fd::FromRawFd;
        // SAFETY: the test holds the only ownership of `raw`.
        drop(unsafe { OwnedFd::from_raw_fd(raw) });
    }

    /// A channel over a loopback CH34x with real pipes on both sides.
    /// Returns (channel, fake device, user ends).
    fn loopback_channel() -> (FileChannel, Arc<FakeDevice>, Channel) {
        let fake = FakeDevice::loopback(0x1a86, 0x7523);
        let bus = FakeBus::new();
        bus.plug(fake.clone());
        let dev = bus.devices().unwrap().remove(0).open().unwrap();
        let driver = create_driver(&dev, 0).unwrap();
        let (internal, user, owned) = pipe_pair().unwrap();
        let mut chan = FileChannel::new(driver, internal, user, owned).unwrap();
        chan.init();
        (chan, fake, user)
    }

    /// Drive the channel until nothing moves, polling its wanted
    /// descriptors with a zero timeout the way the event pump does.
    fn pump(chan: &mut FileChannel) {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        loop {
            let mut moved = chan.service_usb(Duration::ZERO);
            let (want_in, want_out) = chan.poll_wants();
            for (raw, read_side) in [(want_in, true), (want_out, false)] {
                let Some(raw) = raw else { continue };
                let events = if read_side { PollFlags::POLLIN } else { PollFlags::POLLOUT };
                let mut fds = [PollFd::new(fd(raw), events)];
                if poll(&mut fds, PollTimeout::ZERO).unwrap() == 0 {
                    continue;
                }
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                chan.set_events(
                    Readiness {
                        readable: revents.contains(PollFlags::POLLIN),
                        writable: revents.contains(PollFlags::POLLOUT),
                        hangup: revents.contains(PollFlags::POLLHUP),
                    },
                    read_side,
                );
                moved += 1;
            }
            chan.events();
            if moved == 0 {
                break;
            }
        }
    }

    #[test]
    fn init_keeps_two_reads_in_flight() {
        let (chan, _fake, _user) = loopback_channel();
        assert_eq!(chan.bulk_in.pending(), 2);
        assert!(chan.busy());
        assert!(chan.status().is_all_ok());
    }

    #[test]
    fn echoes_pipe_to_pipe() {
        let (mut chan, _fake, user) = loopback_channel();

        nix::unistd::write(fd(user.fd_write), b"hello\n").unwrap();
        pump(&mut chan);

        let mut buf = [0u8; 16];
        let n = nix::unistd::read(fd(user.fd_read), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        // Both reads back in flight once the buffer drained.
        assert_eq!(chan.bulk_in.pending(), 2);
    }

    #[test]
    fn partial_out_transfers_preserve_order() {
        let (mut chan, fake, user) = loopback_channel();
        fake.set_out_limit(3);

        nix::unistd::write(fd(user.fd_write), b"abcdefgh").unwrap();
        pump(&mut chan);

        let mut buf = [0u8; 16];
        let n = nix::unistd::read(fd(user.fd_read), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcdefgh");
    }

    #[test]
    fn input_eof_sets_pipein_hangup_only() {
        let (mut chan, _fake, user) = loopback_channel();

        // Close the application's write end; the next readpipe sees EOF.
        close_fd(user.fd_write);
        chan.set_events(Readiness { readable: true, ..Default::default() }, true);
        chan.events();

        let status = chan.status();
        assert!(!status.read_pipe_ok);
        assert!(status.write_pipe_ok);
        assert!(status.usb_dev_ok);
        assert_eq!(status.bits(), 6);
        assert!(!chan.defunct());
    }

    #[test]
    fn reader_gone_hangs_up_write_side() {
        let (mut chan, _fake, user) = loopback_channel();

        close_fd(user.fd_read);
        nix::unistd::write(fd(user.fd_write), b"x").unwrap();
        pump(&mut chan);

        let status = chan.status();
        assert!(status.read_pipe_ok);
        assert!(!status.write_pipe_ok);
        assert_eq!(status.bits(), 5);
    }

    #[test]
    fn device_gone_flags_and_schedules_removal() {
        let (mut chan, fake, _user) = loopback_channel();

        fake.disconnect();
        chan.service_usb(Duration::ZERO);

        assert!(!chan.status().usb_dev_ok);
        assert_eq!(chan.status().bits() & Status::USB_DEV_OK, 0);
        assert!(chan.defunct());
        assert!(!chan.busy());
    }

    #[test]
    fn close_cancels_and_drains() {
        let (mut chan, _fake, _user) = loopback_channel();

        assert!(chan.busy());
        let safe = chan.close();
        assert!(!safe); // cancellations not yet reaped
        chan.service_usb(Duration::ZERO);
        assert!(!chan.busy());
        // Idempotent.
        assert!(chan.close());
    }

    #[test]
    fn status_bits_never_come_back() {
        let (mut chan, fake, user) = loopback_channel();

        close_fd(user.fd_write);
        chan.set_events(Readiness { readable: true, ..Default::default() }, true);
        chan.events();
        let first = chan.status();
        assert!(!first.read_pipe_ok);

        fake.push_input(b"late data");
        pump(&mut chan);
        let second = chan.status();
        assert!(!second.read_pipe_ok);
        assert!(second.bits() <= first.bits());
    }
}
