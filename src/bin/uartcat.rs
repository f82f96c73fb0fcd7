//! Attach stdin and stdout to a USB-UART device.
//!
//! ```text
//! uartcat 001/002        # by bus/address (decimal)
//! uartcat 1a86:7523      # by vid:pid (hex)
//! uartcat 0403:6010:1    # second port of an FT2232H
//! ```
//!
//! Exits with 0, or with the positive stable error code of the failure.

use std::process::ExitCode;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usbuart::{Channel, Context, DeviceSelector, Error, Status, PROTO_115200_8N1};

#[derive(Parser, Debug)]
#[command(name = "uartcat")]
#[command(about = "Bridge stdin/stdout to a USB-UART adapter")]
struct Args {
    /// Device selector: BUS/DEV[:IFC] in decimal or VID:PID[:IFC] in hex.
    device: String,

    /// Pump timeout in milliseconds while the channel is healthy.
    #[arg(short, long, default_value_t = 1)]
    timeout: i32,
}

/// The channel can still move bytes in at least one direction.
fn is_usable(status: Status) -> bool {
    status.usb_dev_ok && (status.read_pipe_ok || status.write_pipe_ok)
}

fn run(args: &Args) -> Result<(), Error> {
    let selector: DeviceSelector = args.device.parse()?;
    let chnl = Channel { fd_read: 0, fd_write: 1 };

    let ctx = Context::new();
    ctx.attach(selector, chnl, &PROTO_115200_8N1)?;

    let mut timeout = args.timeout;
    let mut count_down = 4;
    let result = loop {
        let res = ctx.pump(timeout);
        let status = match ctx.status(chnl) {
            Ok(status) => status,
            Err(_) => break Ok(()), // channel reaped
        };
        if !is_usable(status) {
            break Ok(());
        }
        match res {
            Ok(_) if status.is_all_ok() => {}
            Ok(_) | Err(Error::NoChannels) => {
                // Degraded: a few short grace rounds to flush what's left.
                timeout = 100;
                count_down -= 1;
                if count_down <= 0 {
                    break Ok(());
                }
            }
            Err(err) => break Err(err),
        }
    };

    debug!("closing channel");
    ctx.close(chnl);
    let _ = ctx.pump(100);
    result
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("uartcat: {err}");
            ExitCode::from((err.code() as i32).min(u8::MAX as i32) as u8)
        }
    }
}
