//! Type definitions for the bridge API.
//!
//! These types model the serial line protocol, the file-descriptor pair a
//! channel is bridged onto, device selection, and channel status bits.

use std::fmt;
use std::os::fd::RawFd;
use std::str::FromStr;

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
    /// 9 data bits.
    Nine,
}

impl DataBits {
    /// Wire encoding: the plain bit count.
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
            Self::Nine => 9,
        }
    }
}

/// Parity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Mark parity (always 1).
    Mark,
    /// Space parity (always 0).
    Space,
}

impl Parity {
    /// Wire encoding shared by the FTDI line register and the PL2303
    /// protocol setup block.
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Odd => 1,
            Self::Even => 2,
            Self::Mark => 3,
            Self::Space => 4,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 1.5 stop bits.
    OnePointFive,
    /// 2 stop bits.
    Two,
}

impl StopBits {
    /// Wire encoding shared by the FTDI line register and the PL2303
    /// protocol setup block.
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            Self::One => 0,
            Self::OnePointFive => 1,
            Self::Two => 2,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware RTS/CTS flow control.
    RtsCts,
    /// Hardware DTR/DSR flow control.
    DtrDsr,
    /// Software XON/XOFF flow control.
    XonXoff,
}

impl FlowControl {
    /// Wire encoding: the mode ordinal.
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            Self::None => 0,
            Self::RtsCts => 1,
            Self::DtrDsr => 2,
            Self::XonXoff => 3,
        }
    }
}

/// Serial line protocol parameters, immutable per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    /// UART baud rate. Must be non-zero.
    pub baudrate: u32,
    /// Number of data bits.
    pub databits: DataBits,
    /// Parity mode.
    pub parity: Parity,
    /// Number of stop bits.
    pub stopbits: StopBits,
    /// Flow control mode.
    pub flowcontrol: FlowControl,
}

/// 115200 baud, 8 data bits, no parity, 1 stop bit, no flow control.
pub const PROTO_115200_8N1: Protocol = Protocol {
    baudrate: 115_200,
    databits: DataBits::Eight,
    parity: Parity::None,
    stopbits: StopBits::One,
    flowcontrol: FlowControl::None,
};

/// 115200 baud, 8N1, RTS/CTS flow control.
pub const PROTO_115200_8N1_RTSCTS: Protocol = Protocol {
    baudrate: 115_200,
    databits: DataBits::Eight,
    parity: Parity::None,
    stopbits: StopBits::One,
    flowcontrol: FlowControl::RtsCts,
};

/// 19200 baud, 8N1, no flow control.
pub const PROTO_19200_8N1: Protocol = Protocol {
    baudrate: 19_200,
    databits: DataBits::Eight,
    parity: Parity::None,
    stopbits: StopBits::One,
    flowcontrol: FlowControl::None,
};

/// 19200 baud, 8N1, RTS/CTS flow control.
pub const PROTO_19200_8N1_RTSCTS: Protocol = Protocol {
    baudrate: 19_200,
    databits: DataBits::Eight,
    parity: Parity::None,
    stopbits: StopBits::One,
    flowcontrol: FlowControl::RtsCts,
};

/// An I/O channel: the pair of file descriptors a device is bridged onto.
///
/// For [`Context::attach`](crate::Context::attach) the caller supplies the
/// pair and the *bridge* reads bytes-to-transmit from `fd_read` and writes
/// received bytes into `fd_write` (`{0, 1}` bridges stdin/stdout). For
/// [`Context::pipe`](crate::Context::pipe) the bridge creates the pipes and
/// returns the application-facing pair: read received bytes from
/// `fd_read`, write bytes-to-transmit into `fd_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Descriptor to read from.
    pub fd_read: RawFd,
    /// Descriptor to write to.
    pub fd_write: RawFd,
}

/// Selects a USB device either by bus position or by vendor/product id.
///
/// `ifc` selects the UART on multi-port adapters (FTDI H parts); it is 0
/// for single-port chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Bus number / device address, as in `lsusb` output.
    BusDev {
        /// USB bus number.
        bus: u8,
        /// Device address on that bus.
        dev: u8,
        /// Interface (port) number.
        ifc: u8,
    },
    /// Vendor id / product id.
    VidPid {
        /// USB vendor id.
        vid: u16,
        /// USB product id.
        pid: u16,
        /// Interface (port) number.
        ifc: u8,
    },
}

impl DeviceSelector {
    /// The interface (port) number carried by the selector.
    pub fn interface(&self) -> u8 {
        match *self {
            Self::BusDev { ifc, .. } => ifc,
            Self::VidPid { ifc, .. } => ifc,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BusDev { bus, dev, ifc } => write!(f, "{bus:03}/{dev:03}:{ifc}"),
            Self::VidPid { vid, pid, ifc } => write!(f, "{vid:04x}:{pid:04x}:{ifc:x}"),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = crate::Error;

    /// Parses `BUS/DEV[:IFC]` (decimal) or `VID:PID[:IFC]` (hex), the
    /// `uartcat` argument grammar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || crate::Error::InvalidParam("device selector");
        if let Some((bus, rest)) = s.split_once('/') {
            let (dev, ifc) = match rest.split_once(':') {
                Some((dev, ifc)) => (dev, Some(ifc)),
                None => (rest, None),
            };
            let bus = bus.parse::<u8>().map_err(|_| bad())?;
            let dev = dev.parse::<u8>().map_err(|_| bad())?;
            let ifc = match ifc {
                Some(i) => i.parse::<u8>().map_err(|_| bad())?,
                None => 0,
            };
            return Ok(Self::BusDev { bus, dev, ifc });
        }
        let mut parts = s.split(':');
        let vid = parts.next().ok_or_else(bad)?;
        let pid = parts.next().ok_or_else(bad)?;
        let ifc = parts.next();
        if parts.next().is_some() {
            return Err(bad());
        }
        let vid = u16::from_str_radix(vid, 16).map_err(|_| bad())?;
        let pid = u16::from_str_radix(pid, 16).map_err(|_| bad())?;
        let ifc = match ifc {
            Some(i) => u8::from_str_radix(i, 16).map_err(|_| bad())?,
            None => 0,
        };
        Ok(Self::VidPid { vid, pid, ifc })
    }
}

/// Channel health, one bit per half.
///
/// Bits are monotone: once a half hangs up its bit never comes back for the
/// lifetime of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// The input pipe (application -> device) is still open.
    pub read_pipe_ok: bool,
    /// The output pipe (device -> application) is still open.
    pub write_pipe_ok: bool,
    /// The USB device is still attached and answering.
    pub usb_dev_ok: bool,
}

impl Status {
    /// Bit reported for a live input pipe.
    pub const READ_PIPE_OK: i32 = 1;
    /// Bit reported for a live output pipe.
    pub const WRITE_PIPE_OK: i32 = 2;
    /// Bit reported for a live USB device.
    pub const USB_DEV_OK: i32 = 4;

    /// The status as the stable bit vector.
    pub fn bits(self) -> i32 {
        (if self.read_pipe_ok { Self::READ_PIPE_OK } else { 0 })
            | (if self.write_pipe_ok { Self::WRITE_PIPE_OK } else { 0 })
            | (if self.usb_dev_ok { Self::USB_DEV_OK } else { 0 })
    }

    /// All three halves are healthy.
    pub fn is_all_ok(self) -> bool {
        self.read_pipe_ok && self.write_pipe_ok && self.usb_dev_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(DataBits::Five.wire_value(), 5);
        assert_eq!(DataBits::Nine.wire_value(), 9);
        assert_eq!(Parity::None.wire_value(), 0);
        assert_eq!(Parity::Space.wire_value(), 4);
        assert_eq!(StopBits::One.wire_value(), 0);
        assert_eq!(StopBits::OnePointFive.wire_value(), 1);
        assert_eq!(StopBits::Two.wire_value(), 2);
        assert_eq!(FlowControl::None.wire_value(), 0);
        assert_eq!(FlowControl::XonXoff.wire_value(), 3);
    }

    #[test]
    fn presets() {
        assert_eq!(PROTO_115200_8N1.baudrate, 115_200);
        assert_eq!(PROTO_115200_8N1.flowcontrol, FlowControl::None);
        assert_eq!(PROTO_115200_8N1_RTSCTS.flowcontrol, FlowControl::RtsCts);
        assert_eq!(PROTO_19200_8N1.baudrate, 19_200);
        assert_eq!(PROTO_19200_8N1_RTSCTS.databits, DataBits::Eight);
    }

    #[test]
    fn selector_bus_dev() {
        let s: DeviceSelector = "001/002".parse().unwrap();
        assert_eq!(s, DeviceSelector::BusDev { bus: 1, dev: 2, ifc: 0 });
        let s: DeviceSelector = "3/12:1".parse().unwrap();
        assert_eq!(s, DeviceSelector::BusDev { bus: 3, dev: 12, ifc: 1 });
    }

    #[test]
    fn selector_vid_pid() {
        let s: DeviceSelector = "0403:6010".parse().unwrap();
        assert_eq!(
            s,
            DeviceSelector::VidPid { vid: 0x0403, pid: 0x6010, ifc: 0 }
        );
        let s: DeviceSelector = "1a86:7523:0".parse().unwrap();
        assert_eq!(
            s,
            DeviceSelector::VidPid { vid: 0x1a86, pid: 0x7523, ifc: 0 }
        );
        // Interface digit is hex in the vid:pid form.
        let s: DeviceSelector = "0403:6011:a".parse().unwrap();
        assert_eq!(s.interface(), 10);
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!("".parse::<DeviceSelector>().is_err());
        assert!("001".parse::<DeviceSelector>().is_err());
        assert!("xx/yy".parse::<DeviceSelector>().is_err());
        assert!("0403:6001:0:9".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn status_bits() {
        let all = Status { read_pipe_ok: true, write_pipe_ok: true, usb_dev_ok: true };
        assert_eq!(all.bits(), 7);
        assert!(all.is_all_ok());

        let write_gone = Status { read_pipe_ok: true, write_pipe_ok: false, usb_dev_ok: true };
        assert_eq!(write_gone.bits(), 5);
        assert!(!write_gone.is_all_ok());

        let dev_gone = Status { read_pipe_ok: true, write_pipe_ok: true, usb_dev_ok: false };
        assert_eq!(dev_gone.bits(), 3);
    }
}
