// src/feed/ws.rs - WebSocket transport over blocking tungstenite
//
// One IO thread per connection:
// - connects, then reports Opened (or Error) through TransportEvents
// - forwards incoming text/binary frames as TransportEvents
// - drains the outbound crossbeam queue between reads
//
// The socket read timeout bounds how long an outbound message waits.

use crate::error::{Error, Result};
use crate::feed::transport::{Connector, Transport, TransportEvents};
use bytes::Bytes;
use crossbeam_channel::TryRecvError;
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::Message;

const DEFAULT_READ_TIMEOUT_MS: u64 = 20;

enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Opens `ws://` connections.
#[derive(Debug, Clone)]
pub struct WsConnector {
    read_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }

    /// Sets the socket read timeout, which is also the worst-case send latency.
    pub fn set_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

impl Connector for WsConnector {
    fn connect(&mut self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>> {
        let (outbound_sender, outbound_receiver) = crossbeam_channel::unbounded();
        let url = url.to_string();
        let read_timeout = self.read_timeout;

        std::thread::Builder::new()
            .name(format!("feed-ws-{}", events.generation()))
            .spawn(move || io_loop(url, events, outbound_receiver, read_timeout))?;

        Ok(Box::new(WsTransport {
            outbound: outbound_sender,
        }))
    }
}

struct WsTransport {
    outbound: crossbeam_channel::Sender<Outbound>,
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: &str) -> Result<()> {
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| Error::TransportClosed)
    }

    fn send_binary(&mut self, data: Bytes) -> Result<()> {
        self.outbound
            .send(Outbound::Binary(data))
            .map_err(|_| Error::TransportClosed)
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

fn io_loop(
    url: String,
    events: TransportEvents,
    outbound: crossbeam_channel::Receiver<Outbound>,
    read_timeout: Duration,
) {
    let mut socket = match tungstenite::connect(url.as_str()) {
        Ok((socket, _response)) => socket,
        Err(e) => {
            events.error(e.to_string());
            return;
        }
    };
    if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
        if let Err(e) = stream.set_read_timeout(Some(read_timeout)) {
            warn!("Failed to set read timeout on {}: {}", url, e);
        }
    }
    info!("WebSocket {} open", url);
    if !events.opened() {
        let _ = socket.close(None);
        return;
    }

    loop {
        loop {
            let message = match outbound.try_recv() {
                Ok(Outbound::Text(text)) => Message::Text(text),
                Ok(Outbound::Binary(data)) => Message::Binary(data.to_vec()),
                Ok(Outbound::Close) | Err(TryRecvError::Disconnected) => {
                    debug!("WebSocket {} closing", url);
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    return;
                }
                Err(TryRecvError::Empty) => break,
            };
            if let Err(e) = socket.send(message) {
                events.error(e.to_string());
                return;
            }
        }

        let delivered = match socket.read() {
            Ok(Message::Text(text)) => events.text(text),
            Ok(Message::Binary(data)) => events.binary(data),
            Ok(Message::Close(frame)) => {
                debug!("WebSocket {} close frame: {:?}", url, frame);
                events.closed();
                return;
            }
            // Ping/pong are answered by tungstenite
            Ok(_) => true,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                true
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                events.closed();
                return;
            }
            Err(e) => {
                events.error(e.to_string());
                return;
            }
        };

        if !delivered {
            debug!("Feed loop gone, closing {}", url);
            let _ = socket.close(None);
            return;
        }
    }
}
