use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use wirechan_frame::{encode_value, FrameConfig, FrameError, FrameWriter, ValueDecoder};
use wirechan_transport::{TransportError, WireAddr, WireStream};

use crate::error::{ChannelError, Result};
use crate::registry::{lock, ListenerId, Listeners};
use crate::sender::ChannelSender;

/// How long `connect` waits for the transport's connected signal.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Configuration for a socket channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Timeout for client-initiated connects.
    pub connect_timeout: Duration,
    /// Frame codec limits applied to both directions.
    pub frame: FrameConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

type MessageListener = Arc<dyn Fn(&Value) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&ChannelError) + Send + Sync>;

struct Shared {
    closed: AtomicBool,
    message_listeners: Mutex<Listeners<MessageListener>>,
    error_listeners: Mutex<Listeners<ErrorListener>>,
    /// Frames queued but not yet handed to the transport.
    pending: Mutex<usize>,
    pending_settled: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            message_listeners: Mutex::new(Listeners::new()),
            error_listeners: Mutex::new(Listeners::new()),
            pending: Mutex::new(0),
            pending_settled: Condvar::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn frame_queued(&self) {
        *lock(&self.pending) += 1;
    }

    fn frame_settled(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.pending_settled.notify_all();
        }
    }

    fn settle_all(&self) {
        *lock(&self.pending) = 0;
        self.pending_settled.notify_all();
    }

    fn dispatch_message(&self, value: &Value) {
        let listeners = lock(&self.message_listeners).snapshot();
        for listener in listeners {
            listener(value);
        }
    }

    fn dispatch_error(&self, err: &ChannelError) {
        let registry = lock(&self.error_listeners);
        if registry.is_empty() {
            debug!(error = %err, "channel error with no error listeners");
            return;
        }
        let listeners = registry.snapshot();
        drop(registry);
        for listener in listeners {
            listener(err);
        }
    }
}

/// One JSON message channel over one stream-socket connection.
///
/// Incoming bytes are reassembled into complete JSON values and dispatched
/// as `message` events in arrival order. Outbound sends are encoded on the
/// caller's thread and drained in FIFO order by a single writer thread, so
/// a slow transport can never reorder frames.
///
/// Once `close` succeeds the handle is permanently unusable; `send` and
/// `close` then fail with [`ChannelError::Closed`].
pub struct SocketChannel {
    shared: Arc<Shared>,
    stream: WireStream,
    outbound: Sender<Vec<u8>>,
    config: ChannelConfig,
    name: String,
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannel")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SocketChannel {
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: WireStream) -> Result<Self> {
        Self::from_stream_with_config(stream, ChannelConfig::default())
    }

    /// Wrap an already-connected stream with explicit configuration.
    ///
    /// The configured frame read/write timeouts are applied to the
    /// connection here; an expired read timeout surfaces as an `error`
    /// event, like any other read failure.
    pub fn from_stream_with_config(stream: WireStream, config: ChannelConfig) -> Result<Self> {
        Self::build(stream, config, "socket".to_string())
    }

    fn build(stream: WireStream, config: ChannelConfig, name: String) -> Result<Self> {
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;
        reader_stream.set_read_timeout(config.frame.read_timeout)?;
        writer_stream.set_write_timeout(config.frame.write_timeout)?;
        let shared = Arc::new(Shared::new());
        let (outbound, queue) = mpsc::channel::<Vec<u8>>();

        spawn_thread("wirechan-reader", {
            let shared = Arc::clone(&shared);
            let frame_config = config.frame.clone();
            move || reader_pump(reader_stream, shared, frame_config)
        })?;

        spawn_thread("wirechan-writer", {
            let shared = Arc::clone(&shared);
            let frame_config = config.frame.clone();
            move || writer_loop(writer_stream, shared, queue, frame_config)
        })?;

        Ok(Self {
            shared,
            stream,
            outbound,
            config,
            name,
        })
    }

    /// Connect to `addr` as a client, bounded by the configured timeout.
    pub fn connect(addr: &WireAddr) -> Result<Self> {
        Self::connect_with_config(addr, ChannelConfig::default())
    }

    /// Connect with explicit configuration.
    pub fn connect_with_config(addr: &WireAddr, config: ChannelConfig) -> Result<Self> {
        let stream =
            WireStream::connect(addr, config.connect_timeout).map_err(|err| match err {
                TransportError::ConnectTimeout { timeout, .. } => {
                    ChannelError::ConnectTimeout(timeout)
                }
                other => ChannelError::Transport(other),
            })?;
        Self::build(stream, config, addr.to_string())
    }

    /// Name identifying this connection: the peer address for client
    /// connects, `"socket"` for wrapped streams.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a `message` listener. Invoked once per decoded value, in
    /// arrival order.
    pub fn on_message(&self, listener: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        lock(&self.shared.message_listeners).add(Arc::new(listener))
    }

    /// Register an `error` listener for transport and framing failures.
    pub fn on_error(
        &self,
        listener: impl Fn(&ChannelError) + Send + Sync + 'static,
    ) -> ListenerId {
        lock(&self.shared.error_listeners).add(Arc::new(listener))
    }

    /// Remove one `message` registration. Returns false if absent.
    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        lock(&self.shared.message_listeners).remove(id)
    }

    /// Remove one `error` registration. Returns false if absent.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        lock(&self.shared.error_listeners).remove(id)
    }

    /// Encode `value` and queue the frame for transmission.
    ///
    /// Serialization failures surface here, synchronously, and queue
    /// nothing. Ordering among `send` calls is the order frames reach the
    /// wire.
    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut buf = BytesMut::new();
        let payload_len = encode_value(value, &mut buf)?;
        if payload_len > self.config.frame.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.config.frame.max_payload_size,
            }
            .into());
        }

        // Count before handing off so the writer can never settle a frame
        // ahead of its accounting.
        self.shared.frame_queued();
        // The writer thread drops its queue end after a fatal write error.
        self.outbound.send(buf.to_vec()).map_err(|_| {
            self.shared.frame_settled();
            ChannelError::Closed
        })
    }

    /// Block until every queued frame has been handed to the transport, or
    /// `timeout` elapses. Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let pending = lock(&self.shared.pending);
        let (guard, result) = self
            .shared
            .pending_settled
            .wait_timeout_while(pending, timeout, |pending| *pending > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(guard);
        !result.timed_out()
    }

    /// Terminate the connection and invalidate the handle.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        debug!("closing channel");
        self.stream.shutdown()?;
        Ok(())
    }

    /// Whether `close` has been called (or a fatal write error occurred).
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl ChannelSender for SocketChannel {
    fn name(&self) -> &str {
        SocketChannel::name(self)
    }

    fn send_value(&self, value: &Value) -> Result<()> {
        self.send(value)
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown();
    }
}

fn spawn_thread(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|err| ChannelError::Transport(TransportError::Io(err)))
}

/// Reads byte deliveries, reassembles frames, dispatches `message` events.
///
/// A framing error poisons the connection's decode state, so the pump
/// dispatches one `error` event and stops; there is no resynchronization.
fn reader_pump(mut stream: WireStream, shared: Arc<Shared>, config: FrameConfig) {
    let mut decoder = ValueDecoder::with_config(config);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("peer closed connection");
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if !shared.is_closed() {
                    shared.dispatch_error(&ChannelError::Frame(FrameError::Io(err)));
                }
                return;
            }
        };

        decoder.feed(&chunk[..read]);
        loop {
            match decoder.next_value() {
                Ok(Some(value)) => {
                    trace!("dispatching message");
                    shared.dispatch_message(&value);
                }
                Ok(None) => break,
                Err(err) => {
                    shared.dispatch_error(&err.into());
                    return;
                }
            }
        }
    }
}

/// Drains the outbound FIFO, writing each frame fully before the next.
///
/// Frames still queued once the channel is closed surface as `Closed`
/// error events instead of touching a dead connection.
fn writer_loop(
    stream: WireStream,
    shared: Arc<Shared>,
    queue: Receiver<Vec<u8>>,
    config: FrameConfig,
) {
    let mut writer = FrameWriter::with_config(stream, config);

    while let Ok(frame) = queue.recv() {
        if shared.is_closed() {
            shared.dispatch_error(&ChannelError::Closed);
            shared.frame_settled();
            continue;
        }

        if let Err(err) = writer.write_encoded(&frame) {
            if shared.is_closed() {
                shared.dispatch_error(&ChannelError::Closed);
            } else {
                shared.dispatch_error(&err.into());
            }
            // Dropping the queue makes later sends fail with Closed; frames
            // already queued will never be written, so say so.
            while queue.try_recv().is_ok() {
                shared.dispatch_error(&ChannelError::Closed);
            }
            shared.settle_all();
            return;
        }
        shared.frame_settled();
        trace!(bytes = frame.len(), "frame written");
    }
    shared.settle_all();
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use serde_json::json;
    use wirechan_frame::{FrameReader, FrameWriter};
    use wirechan_transport::WireListener;

    use super::*;

    const EVENT_WAIT: Duration = Duration::from_secs(3);

    /// Client channel plus the raw server-side stream it is talking to.
    fn tcp_pair() -> (SocketChannel, WireStream) {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();

        let accepted = thread::spawn(move || listener.accept().unwrap());
        let channel = SocketChannel::connect(&bound).unwrap();
        (channel, accepted.join().unwrap())
    }

    #[test]
    fn send_reaches_the_peer_framed() {
        let (channel, server) = tcp_pair();
        let mut reader = FrameReader::new(server);

        channel.send(&json!({"a": 1})).unwrap();
        channel.send(&json!({"b": 22})).unwrap();

        assert_eq!(reader.read_value().unwrap(), json!({"a": 1}));
        assert_eq!(reader.read_value().unwrap(), json!({"b": 22}));
    }

    #[test]
    fn sends_preserve_call_order() {
        let (channel, server) = tcp_pair();
        let mut reader = FrameReader::new(server);

        for i in 0..100 {
            channel.send(&json!({"seq": i})).unwrap();
        }
        for i in 0..100 {
            assert_eq!(reader.read_value().unwrap(), json!({"seq": i}));
        }
    }

    #[test]
    fn flush_returns_once_queued_frames_are_written() {
        let (channel, server) = tcp_pair();
        let mut reader = FrameReader::new(server);

        for i in 0..10 {
            channel.send(&json!({"seq": i})).unwrap();
        }
        assert!(channel.flush(EVENT_WAIT), "writer should drain the queue");

        for i in 0..10 {
            assert_eq!(reader.read_value().unwrap(), json!({"seq": i}));
        }
    }

    #[test]
    fn flush_on_idle_channel_returns_immediately() {
        let (channel, _server) = tcp_pair();
        assert!(channel.flush(Duration::from_millis(10)));
    }

    #[test]
    fn messages_dispatch_in_arrival_order() {
        let (channel, server) = tcp_pair();
        let (tx, rx) = mpsc::channel();
        channel.on_message(move |value| {
            let _ = tx.send(value.clone());
        });

        let mut writer = FrameWriter::new(server);
        writer.send(&json!({"n": 1})).unwrap();
        writer.send(&json!({"n": 2})).unwrap();
        writer.send(&json!({"n": 3})).unwrap();

        assert_eq!(rx.recv_timeout(EVENT_WAIT).unwrap(), json!({"n": 1}));
        assert_eq!(rx.recv_timeout(EVENT_WAIT).unwrap(), json!({"n": 2}));
        assert_eq!(rx.recv_timeout(EVENT_WAIT).unwrap(), json!({"n": 3}));
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let (channel, server) = tcp_pair();
        let (kept_tx, kept_rx) = mpsc::channel();
        let (removed_tx, removed_rx) = mpsc::channel();

        channel.on_message(move |value| {
            let _ = kept_tx.send(value.clone());
        });
        let removed = channel.on_message(move |value| {
            let _ = removed_tx.send(value.clone());
        });
        assert!(channel.remove_message_listener(removed));
        assert!(!channel.remove_message_listener(removed));

        let mut writer = FrameWriter::new(server);
        writer.send(&json!("after-removal")).unwrap();

        assert_eq!(
            kept_rx.recv_timeout(EVENT_WAIT).unwrap(),
            json!("after-removal")
        );
        assert!(removed_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn doubly_registered_listener_removed_once_still_fires_once() {
        let (channel, server) = tcp_pair();
        let (tx, rx) = mpsc::channel();

        let shared_tx = Arc::new(tx);
        let make = |tx: Arc<mpsc::Sender<Value>>| {
            move |value: &Value| {
                let _ = tx.send(value.clone());
            }
        };
        let first = channel.on_message(make(Arc::clone(&shared_tx)));
        let _second = channel.on_message(make(shared_tx));
        assert!(channel.remove_message_listener(first));

        let mut writer = FrameWriter::new(server);
        writer.send(&json!(7)).unwrap();

        assert_eq!(rx.recv_timeout(EVENT_WAIT).unwrap(), json!(7));
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "only one occurrence should remain"
        );
    }

    #[test]
    fn framing_error_becomes_error_event() {
        let (channel, mut server) = tcp_pair();
        let (tx, rx) = mpsc::channel();
        channel.on_error(move |err| {
            let _ = tx.send(err.to_string());
        });

        use std::io::Write;
        server.write_all(b"not-a-frame@").unwrap();
        server.flush().unwrap();

        let reported = rx.recv_timeout(EVENT_WAIT).unwrap();
        assert!(reported.contains("invalid frame header"), "{reported}");
    }

    #[test]
    fn closed_handle_rejects_send_and_close() {
        let (channel, server) = tcp_pair();
        let mut reader = FrameReader::new(server);

        channel.close().unwrap();

        assert!(matches!(channel.send(&json!(1)), Err(ChannelError::Closed)));
        assert!(matches!(channel.close(), Err(ChannelError::Closed)));
        assert!(channel.is_closed());

        // No frame made it to the wire; the peer just sees EOF.
        assert!(matches!(
            reader.read_value(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn serialization_failure_is_synchronous_and_queues_nothing() {
        #[derive(serde::Serialize)]
        struct Bad {
            #[serde(serialize_with = "always_fail")]
            field: u8,
        }
        fn always_fail<S: serde::Serializer>(_: &u8, _s: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("nope"))
        }

        let (channel, server) = tcp_pair();
        let mut reader = FrameReader::new(server);

        let err = channel.send(&Bad { field: 0 }).unwrap_err();
        assert!(matches!(err, ChannelError::Frame(FrameError::Json(_))));

        // The channel still works for valid values.
        channel.send(&json!({"ok": true})).unwrap();
        assert_eq!(reader.read_value().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn oversized_payload_rejected_synchronously() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();
        let accepted = thread::spawn(move || listener.accept().unwrap());

        let config = ChannelConfig {
            frame: FrameConfig {
                max_payload_size: 8,
                ..FrameConfig::default()
            },
            ..ChannelConfig::default()
        };
        let channel = SocketChannel::connect_with_config(&bound, config).unwrap();
        let _server = accepted.join().unwrap();

        let err = channel.send(&json!({"way": "too large"})).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Frame(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn connect_refused_surfaces_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = WireAddr::Tcp(listener.local_addr().unwrap());
        drop(listener);

        let err = SocketChannel::connect(&addr).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(_) | ChannelError::ConnectTimeout(_)
        ));
    }

    #[test]
    fn server_side_channel_from_accepted_stream() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();

        let accepted = thread::spawn(move || listener.accept().unwrap());
        let client = SocketChannel::connect(&bound).unwrap();
        let server = SocketChannel::from_stream(accepted.join().unwrap()).unwrap();

        let (tx, rx) = mpsc::channel();
        server.on_message(move |value| {
            let _ = tx.send(value.clone());
        });

        client.send(&json!({"both": "ends"})).unwrap();
        assert_eq!(
            rx.recv_timeout(EVENT_WAIT).unwrap(),
            json!({"both": "ends"})
        );
    }

    #[test]
    fn connected_channel_is_named_after_the_peer_addr() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();

        let accepted = thread::spawn(move || listener.accept().unwrap());
        let client = SocketChannel::connect(&bound).unwrap();
        let server = SocketChannel::from_stream(accepted.join().unwrap()).unwrap();

        assert_eq!(client.name(), bound.to_string());
        assert_eq!(server.name(), "socket");

        let seam: &dyn ChannelSender = &client;
        assert_eq!(seam.name(), bound.to_string());
    }

    #[test]
    fn read_timeout_bounds_peer_silence() {
        let addr: WireAddr = "127.0.0.1:0".parse().unwrap();
        let listener = WireListener::bind(&addr).unwrap();
        let bound = listener.addr().unwrap();
        let accepted = thread::spawn(move || listener.accept().unwrap());

        let config = ChannelConfig {
            frame: FrameConfig {
                read_timeout: Some(Duration::from_millis(50)),
                ..FrameConfig::default()
            },
            ..ChannelConfig::default()
        };
        let channel = SocketChannel::connect_with_config(&bound, config).unwrap();
        let _server = accepted.join().unwrap();

        let (tx, rx) = mpsc::channel();
        channel.on_error(move |err| {
            let _ = tx.send(matches!(err, ChannelError::Frame(FrameError::Io(_))));
        });

        // The peer never writes; the timeout surfaces as an error event.
        assert!(rx.recv_timeout(EVENT_WAIT).unwrap());
    }
}
