// src/feed/transport.rs - Duplex message transport boundary
//
// The supervisor never touches sockets. A Connector opens a Transport and the
// transport's reader side posts TransportEvents into the supervisor's event queue,
// tagged with the connection generation so events from a replaced transport are
// ignored.

use crate::error::Result;
use crate::feed::supervisor::SupervisorEvent;
use bytes::Bytes;

/// Event produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established, messages may be sent.
    Opened,
    Text(String),
    Binary(Bytes),
    /// Peer or local side closed the connection.
    Closed,
    Error(String),
}

/// Outbound half of an open connection.
pub trait Transport {
    fn send_text(&mut self, text: &str) -> Result<()>;

    fn send_binary(&mut self, data: Bytes) -> Result<()>;

    /// Close the connection. No events for it are processed afterwards.
    fn close(&mut self);
}

/// Opens transports.
pub trait Connector {
    /// Start connecting to `url`.
    ///
    /// The returned transport reports [`TransportEvent::Opened`] through `events`
    /// once messages may be sent.
    fn connect(&mut self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>>;
}

/// Posts transport events into the feed loop.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    sender: crossbeam_channel::Sender<SupervisorEvent>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, sender: crossbeam_channel::Sender<SupervisorEvent>) -> Self {
        Self { generation, sender }
    }

    /// Connection generation these events belong to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false if the feed loop is gone.
    pub fn post(&self, event: TransportEvent) -> bool {
        self.sender
            .send(SupervisorEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.post(TransportEvent::Opened)
    }

    pub fn text(&self, text: impl Into<String>) -> bool {
        self.post(TransportEvent::Text(text.into()))
    }

    pub fn binary(&self, data: impl Into<Bytes>) -> bool {
        self.post(TransportEvent::Binary(data.into()))
    }

    pub fn closed(&self) -> bool {
        self.post(TransportEvent::Closed)
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.post(TransportEvent::Error(reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_tagged_with_generation() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let events = TransportEvents::new(3, sender);
        assert!(events.binary(vec![1u8, 2, 3]));
        assert!(events.closed());

        match receiver.try_recv().unwrap() {
            SupervisorEvent::Transport { generation, event } => {
                assert_eq!(generation, 3);
                assert_eq!(event, TransportEvent::Binary(Bytes::from_static(&[1, 2, 3])));
            }
            _ => panic!("expected transport event"),
        }
        assert!(matches!(
            receiver.try_recv().unwrap(),
            SupervisorEvent::Transport { event: TransportEvent::Closed, .. }
        ));
    }

    #[test]
    fn test_post_after_loop_gone() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let events = TransportEvents::new(1, sender);
        drop(receiver);
        assert!(!events.opened());
    }
}
