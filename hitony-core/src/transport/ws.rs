//! Blocking WebSocket transport backend (feature `ws`).
//!
//! One reader thread per connection drives the [`TransportSink`]; sends go
//! through a shared handle from the control worker. Keepalive is delegated to
//! TCP (10 s idle, 5 s probe interval, 3 misses) instead of application-level
//! ping, so a stalled peer is detected by the kernel even while the control
//! worker is busy.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, Message, WebSocket};

use crate::error::{HitonyError, Result};
use crate::identity::DeviceIdentity;

use super::sink::TransportSink;
use super::{Opcode, Transport, TransportFactory};

/// TCP keepalive parameters: idle 10 s, probe every 5 s, 3 misses.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(not(windows))]
const KEEPALIVE_RETRIES: u32 = 3;

/// Socket read timeout; bounds how long the reader holds the socket lock.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

pub struct WsTransportFactory {
    url: String,
    identity: DeviceIdentity,
}

impl WsTransportFactory {
    pub fn new(url: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            url: url.into(),
            identity,
        }
    }
}

impl TransportFactory for WsTransportFactory {
    fn connect(&mut self, mut sink: TransportSink) -> Result<Box<dyn Transport>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| HitonyError::Transport(format!("bad url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "x-device-id",
            HeaderValue::from_str(&self.identity.device_id)
                .map_err(|e| HitonyError::Transport(format!("bad device id header: {e}")))?,
        );
        headers.insert(
            "x-device-token",
            HeaderValue::from_str(&self.identity.device_token)
                .map_err(|e| HitonyError::Transport(format!("bad device token header: {e}")))?,
        );

        info!(url = %self.url, device_id = %self.identity.device_id, "connecting");
        let (socket, _response) = tungstenite::connect(request)
            .map_err(|e| HitonyError::Transport(format!("connect: {e}")))?;

        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            tune_tcp(stream);
        }

        let socket = Arc::new(Mutex::new(socket));
        let connected = Arc::new(AtomicBool::new(true));

        sink.on_connected();

        thread::Builder::new()
            .name("ws-reader".into())
            .spawn({
                let socket = Arc::clone(&socket);
                let connected = Arc::clone(&connected);
                move || reader_loop(socket, connected, sink)
            })
            .map_err(|e| HitonyError::Transport(format!("reader spawn: {e}")))?;

        Ok(Box::new(WsTransport { socket, connected }))
    }
}

fn tune_tcp(stream: &TcpStream) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!(error = %e, "set_read_timeout failed");
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "set_nodelay failed");
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "tcp keepalive setup failed");
    }
}

fn reader_loop(socket: Arc<Mutex<WsSocket>>, connected: Arc<AtomicBool>, mut sink: TransportSink) {
    loop {
        let result = {
            let mut guard = socket.lock();
            guard.read()
        };
        match result {
            Ok(Message::Binary(payload)) => sink.on_frame(Opcode::Binary, &payload),
            Ok(Message::Text(payload)) => sink.on_frame(Opcode::Text, payload.as_bytes()),
            // The library answers pings itself.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!(?frame, "close frame received");
            }
            Err(WsError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Read timeout with the lock released so sends interleave.
                thread::sleep(Duration::from_millis(2));
            }
            Err(e) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!(error = %e, "connection lost");
                }
                sink.on_disconnected();
                break;
            }
        }
        if !connected.load(Ordering::Acquire) {
            // Closed locally; surface exactly one disconnect event.
            sink.on_disconnected();
            break;
        }
    }
    debug!("reader exiting");
}

struct WsTransport {
    socket: Arc<Mutex<WsSocket>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    fn send(&self, msg: Message) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(HitonyError::NotConnected);
        }
        let mut guard = self.socket.lock();
        guard
            .send(msg)
            .map_err(|e| HitonyError::Transport(format!("send: {e}")))
    }
}

impl Transport for WsTransport {
    fn send_text(&self, text: &str) -> Result<()> {
        self.send(Message::Text(text.to_string()))
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send(Message::Binary(data.to_vec()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let mut guard = self.socket.lock();
            if let Err(e) = guard.close(None) {
                debug!(error = %e, "close handshake failed");
            }
        }
    }
}
