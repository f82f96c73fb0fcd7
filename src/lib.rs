//! User-space bridge exposing USB serial adapters as file descriptors.
//!
//! This crate attaches a USB-to-UART adapter (CH340/CH341, FTDI
//! FT232/FT2232/FT4232, Prolific PL2303) to an ordinary file-descriptor
//! pair: the application reads received bytes from one descriptor and
//! writes bytes to transmit into the other, while the [`Context`] event
//! pump moves data between the descriptors and the chip's bulk endpoints.
//! No kernel serial driver is involved.
//!
//! # Quick Start
//!
//! ```no_run
//! use usbuart::{Context, DeviceSelector, PROTO_115200_8N1};
//!
//! let ctx = Context::new();
//! // Bridge the first CH340 on the bus into a fresh pipe pair.
//! let sel: DeviceSelector = "1a86:7523".parse()?;
//! let ch = ctx.pipe(sel, &PROTO_115200_8N1)?;
//!
//! // Pump events; read(ch.fd_read) / write(ch.fd_write) from anywhere.
//! loop {
//!     match ctx.pump(100) {
//!         Ok(_) => {}
//!         Err(usbuart::Error::NoChannels) => break,
//!         Err(err) => return Err(err),
//!     }
//! }
//! # Ok::<(), usbuart::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`Context`] owns the channel list and runs the unified event pump:
//!   one `poll` over the pipe descriptors channels are waiting on,
//!   followed by a drain of bulk transfer completions.
//! - Each channel double-buffers bulk IN reads and keeps one bulk OUT
//!   transfer in flight, preserving byte order independently in each
//!   direction.
//! - Chip specifics (probe sequences, baud programming, transfer
//!   framing) live behind the [`driver`] plug-in layer.
//! - The [`usb`] module isolates the transport: [`nusb`] on real
//!   hardware, an in-memory loopback bus in the test-suite.

mod channel;
pub mod context;
pub mod driver;
pub mod error;
pub mod types;
pub mod usb;

// ---- Convenience re-exports ----

pub use context::Context;
pub use error::{Code, Error, Result};
pub use types::{
    Channel, DataBits, DeviceSelector, FlowControl, Parity, Protocol, Status, StopBits,
    PROTO_115200_8N1, PROTO_115200_8N1_RTSCTS, PROTO_19200_8N1, PROTO_19200_8N1_RTSCTS,
};
