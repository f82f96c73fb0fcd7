//! Error types for the usbuart crate.

/// Stable numeric result codes.
///
/// These values are part of the external ABI: a flat C-style wrapper (or
/// `uartcat`'s exit status) reports failures as the negated code. The
/// numbering is fixed; new codes may only be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    /// No error.
    Success = 0,
    /// The context has no more live channels.
    NoChannels = 1,
    /// Method not implemented by this driver.
    NotImplemented = 2,
    /// Invalid parameter passed to the API.
    InvalidParam = 3,
    /// The requested channel does not exist.
    NoChannel = 4,
    /// Access permission denied.
    NoAccess = 5,
    /// The device is not supported.
    NotSupported = 6,
    /// The device does not exist.
    NoDevice = 7,
    /// Claiming the interface failed.
    NoInterface = 8,
    /// The requested interface is busy.
    InterfaceBusy = 9,
    /// An error inside the USB backend library.
    LibusbError = 10,
    /// A USB level error.
    UsbError = 11,
    /// A hardware level error.
    DeviceError = 12,
    /// Unsupported baud rate.
    BadBaudrate = 13,
    /// The device returned an unexpected value while probing.
    ProbeMismatch = 14,
    /// A control transfer failed.
    ControlError = 15,
    /// I/O error on an attached file.
    IoError = 16,
    /// fcntl failed on an attached file.
    FcntlError = 17,
    /// poll returned EINVAL.
    PollError = 18,
    /// Failed to create a pipe.
    PipeError = 19,
    /// Memory allocation failed.
    OutOfMemory = 20,
    /// Any other error.
    UnknownError = 21,
}

impl Code {
    /// The negated integer form used at flat API boundaries.
    pub fn negative(self) -> i32 {
        -(self as i32)
    }
}

/// The error type for usbuart operations.
///
/// Every variant maps onto exactly one stable [`Code`]; variants carry the
/// underlying OS or backend error where one exists.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The context has no more live channels. Returned by the event pump
    /// when it ran but nothing is attached; callers use it as the natural
    /// termination signal.
    #[error("context has no more live channels")]
    NoChannels,

    /// The operation is not implemented by the active chip driver.
    #[error("not implemented by this driver")]
    NotImplemented,

    /// Invalid argument(s) were provided.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// No attached channel matches the given descriptor pair.
    #[error("channel does not exist")]
    NoChannel,

    /// Access to the device was denied.
    #[error("access denied")]
    NoAccess,

    /// No registered driver recognises the device.
    #[error("device is not supported")]
    NotSupported,

    /// No matching USB device was found.
    #[error("device not found")]
    NoDevice,

    /// The requested interface does not exist on the device.
    #[error("claiming the interface failed")]
    NoInterface,

    /// The interface is claimed by someone else.
    #[error("interface is busy")]
    InterfaceBusy,

    /// An error from the USB backend library.
    #[error("USB backend error: {0}")]
    Backend(#[from] nusb::Error),

    /// A USB level failure not covered by a more specific code.
    #[error("USB error")]
    Usb,

    /// The hardware reported an error.
    #[error("device error")]
    Device,

    /// The requested baud rate cannot be programmed on this chip.
    #[error("unsupported baud rate {0}")]
    BadBaudrate(u32),

    /// The device answered a probe sequence with an unexpected value.
    #[error("device returned unexpected value while probing")]
    ProbeMismatch,

    /// A control transfer failed.
    #[error("control transfer failed")]
    Control,

    /// I/O error on an attached file descriptor.
    #[error("i/o error on attached file: {0}")]
    Io(#[source] std::io::Error),

    /// fcntl failed on an attached file descriptor.
    #[error("fcntl failed on attached file: {0}")]
    Fcntl(#[source] std::io::Error),

    /// poll rejected the descriptor set.
    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    /// Creating an anonymous pipe failed.
    #[error("failed to create a pipe: {0}")]
    Pipe(#[source] std::io::Error),

    /// A buffer or transfer allocation failed.
    #[error("memory allocation failed")]
    OutOfMemory,

    /// Anything else.
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// The stable code this error maps onto.
    pub fn code(&self) -> Code {
        match self {
            Error::NoChannels => Code::NoChannels,
            Error::NotImplemented => Code::NotImplemented,
            Error::InvalidParam(_) => Code::InvalidParam,
            Error::NoChannel => Code::NoChannel,
            Error::NoAccess => Code::NoAccess,
            Error::NotSupported => Code::NotSupported,
            Error::NoDevice => Code::NoDevice,
            Error::NoInterface => Code::NoInterface,
            Error::InterfaceBusy => Code::InterfaceBusy,
            Error::Backend(_) => Code::LibusbError,
            Error::Usb => Code::UsbError,
            Error::Device => Code::DeviceError,
            Error::BadBaudrate(_) => Code::BadBaudrate,
            Error::ProbeMismatch => Code::ProbeMismatch,
            Error::Control => Code::ControlError,
            Error::Io(_) => Code::IoError,
            Error::Fcntl(_) => Code::FcntlError,
            Error::Poll(_) => Code::PollError,
            Error::Pipe(_) => Code::PipeError,
            Error::OutOfMemory => Code::OutOfMemory,
            Error::Unknown => Code::UnknownError,
        }
    }
}

/// A specialized `Result` type for usbuart operations.
pub type Result<T> = std::result::Result<T, Error>;
