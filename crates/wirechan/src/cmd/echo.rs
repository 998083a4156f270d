use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wirechan_frame::{FrameError, FrameReader, FrameWriter};
use wirechan_transport::{TransportError, WireAddr, WireListener};

use crate::cmd::EchoArgs;
use crate::exit::{frame_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::OutputFormat;

/// How often blocked accepts and reads re-check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
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
        if let Some((uid, gid, pid)) = stream.peer_credentials() {
            tracing::debug!(uid, gid, pid, "peer connected");
        }
        let write_half = stream
            .try_clone()
            .map_err(|err| transport_error("stream clone failed", err))?;
        let mut reader = FrameReader::new(stream);
        let mut writer = FrameWriter::new(write_half);

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
                // A framing error poisons the connection; drop it and keep
                // serving new ones.
                Err(err) => {
                    tracing::warn!(error = %err, "dropping connection");
                    break;
                }
            };

            tracing::info!("echoing message");
            writer
                .send(&message)
                .map_err(|err| frame_error("echo send failed", err))?;
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
