use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wirechan_frame::{FrameError, FrameReader};
use wirechan_transport::{TransportError, WireAddr, WireListener};

use crate::cmd::ListenArgs;
use crate::exit::{frame_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

/// How often blocked accepts and reads re-check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let addr: WireAddr = args
        .addr
        .parse()
        .map_err(|err| CliError::new(USAGE, format!("bad address: {err}")))?;
    let listener = WireListener::bind(&addr).map_err(|err| transport_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| transport_error("listener setup failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(TransportError::Accept(err)) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(SHUTDOWN_POLL);
                continue;
            }
            Err(err) => return Err(transport_error("accept failed", err)),
        };
        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(SHUTDOWN_POLL)))
            .map_err(|err| transport_error("stream setup failed", err))?;
        let peer = format!("{addr}");
        let mut reader = FrameReader::new(stream);

        while running.load(Ordering::SeqCst) {
            let message = match reader.read_value() {
                Ok(message) => message,
                Err(FrameError::ConnectionClosed) => break,
                Err(FrameError::Io(err))
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(frame_error("receive failed", err)),
            };

            print_message(&message, &peer, format);
            printed = printed.saturating_add(1);

            if let Some(count) = args.count {
                if printed >= count {
                    return Ok(SUCCESS);
                }
            }
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
