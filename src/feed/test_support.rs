// src/feed/test_support.rs - Recording doubles for sinks and transports

use crate::error::{Error, Result, SinkError};
use crate::feed::protocol::ChannelId;
use crate::feed::sink::{BufferedRanges, MediaSink, SinkFactory, SinkNotifier, SinkReadiness};
use crate::feed::transport::{Connector, Transport, TransportEvents};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) type SharedSinkState = Rc<RefCell<MockSinkState>>;

/// How a [`MockSink`] behaves.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SinkScript {
    unsupported: bool,
    deferred_open: bool,
}

impl SinkScript {
    pub(crate) fn unsupported(mut self) -> Self {
        self.unsupported = true;
        self
    }

    /// `open` returns `Pending`; the test sends `SourceOpen` itself.
    pub(crate) fn deferred_open(mut self) -> Self {
        self.deferred_open = true;
        self
    }
}

#[derive(Default)]
pub(crate) struct MockSinkState {
    pub opened: bool,
    pub detached: bool,
    pub mime: Option<String>,
    pub notifier: Option<SinkNotifier>,
    pub appended: Vec<Bytes>,
    /// Operations started and not yet completed
    pub outstanding: usize,
    pub max_outstanding: usize,
    pub buffered: BufferedRanges,
    pub current_time: f64,
    pub removals: Vec<(f64, f64)>,
    pub seeks: Vec<f64>,
    pub reject_next_append: Option<String>,
}

impl MockSinkState {
    pub(crate) fn appended_tags(&self) -> Vec<Vec<u8>> {
        self.appended.iter().map(|chunk| chunk.to_vec()).collect()
    }

    /// Finish the oldest outstanding operation. The caller delivers `UpdateEnd`.
    pub(crate) fn complete(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn begin(&mut self) {
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
    }
}

pub(crate) struct MockSink {
    script: SinkScript,
    state: SharedSinkState,
}

impl MockSink {
    pub(crate) fn new(script: SinkScript) -> (Self, SharedSinkState) {
        let state = Rc::new(RefCell::new(MockSinkState::default()));
        (
            Self {
                script,
                state: state.clone(),
            },
            state,
        )
    }
}

impl MediaSink for MockSink {
    fn is_type_supported(&self, _mime: &str) -> bool {
        !self.script.unsupported
    }

    fn open(&mut self, mime: &str, notifier: SinkNotifier) -> std::result::Result<SinkReadiness, SinkError> {
        let mut state = self.state.borrow_mut();
        state.opened = true;
        state.mime = Some(mime.to_string());
        state.notifier = Some(notifier);
        if self.script.deferred_open {
            Ok(SinkReadiness::Pending)
        } else {
            Ok(SinkReadiness::Ready)
        }
    }

    fn append_buffer(&mut self, chunk: Bytes) -> std::result::Result<(), SinkError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.reject_next_append.take() {
            return Err(SinkError::Rejected(reason));
        }
        if state.detached {
            return Err(SinkError::NotOpen);
        }
        state.appended.push(chunk);
        state.begin();
        Ok(())
    }

    fn updating(&self) -> bool {
        self.state.borrow().outstanding > 0
    }

    fn buffered(&self) -> BufferedRanges {
        self.state.borrow().buffered.clone()
    }

    fn remove(&mut self, start: f64, end: f64) -> std::result::Result<(), SinkError> {
        let mut state = self.state.borrow_mut();
        state.removals.push((start, end));
        state.buffered.remove(start, end);
        state.begin();
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.state.borrow().current_time
    }

    fn set_current_time(&mut self, time: f64) {
        let mut state = self.state.borrow_mut();
        state.current_time = time;
        state.seeks.push(time);
    }

    fn detach(&mut self) {
        self.state.borrow_mut().detached = true;
    }
}

#[derive(Default)]
struct FactoryState {
    /// Latest sink per channel
    sinks: HashMap<ChannelId, SharedSinkState>,
    targets: Vec<(ChannelId, String)>,
    script: SinkScript,
}

/// Sink factory handing out [`MockSink`]s and keeping their state.
#[derive(Clone, Default)]
pub(crate) struct RecordingSinkFactory {
    state: Rc<RefCell<FactoryState>>,
}

impl RecordingSinkFactory {
    pub(crate) fn sink(&self, channel: ChannelId) -> Option<SharedSinkState> {
        self.state.borrow().sinks.get(&channel).cloned()
    }

    pub(crate) fn targets(&self) -> Vec<(ChannelId, String)> {
        self.state.borrow().targets.clone()
    }

    /// Sinks created from now on refuse every codec.
    pub(crate) fn refuse_codecs(&self) {
        let mut state = self.state.borrow_mut();
        state.script = state.script.unsupported();
    }
}

impl SinkFactory for RecordingSinkFactory {
    fn create_sink(&mut self, channel: ChannelId, target: &str) -> Box<dyn MediaSink> {
        let mut state = self.state.borrow_mut();
        let (sink, sink_state) = MockSink::new(state.script);
        state.sinks.insert(channel, sink_state);
        state.targets.push((channel, target.to_string()));
        Box::new(sink)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Sent {
    Text(String),
    Binary(Bytes),
}

#[derive(Default)]
struct ConnectorState {
    urls: Vec<String>,
    events: Option<TransportEvents>,
    sent: Vec<Sent>,
    closed: usize,
    fail_next: Option<String>,
}

/// Connector whose transports open immediately and record what is sent.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Rc<RefCell<ConnectorState>>,
}

impl MockConnector {
    pub(crate) fn connects(&self) -> usize {
        self.state.borrow().urls.len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.state.borrow().urls.clone()
    }

    /// Event sink of the most recent connection.
    pub(crate) fn events(&self) -> TransportEvents {
        self.state
            .borrow()
            .events
            .clone()
            .expect("no connection made yet")
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.state
            .borrow()
            .sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Text(text) => Some(text.clone()),
                Sent::Binary(_) => None,
            })
            .collect()
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.borrow().closed
    }

    pub(crate) fn fail_next(&self, reason: impl Into<String>) {
        self.state.borrow_mut().fail_next = Some(reason.into());
    }
}

impl Connector for MockConnector {
    fn connect(&mut self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.fail_next.take() {
            return Err(Error::TransportError(reason));
        }
        state.urls.push(url.to_string());
        state.events = Some(events.clone());
        events.opened();
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            open: true,
        }))
    }
}

struct MockTransport {
    state: Rc<RefCell<ConnectorState>>,
    open: bool,
}

impl Transport for MockTransport {
    fn send_text(&mut self, text: &str) -> Result<()> {
        if !self.open {
            return Err(Error::TransportClosed);
        }
        self.state.borrow_mut().sent.push(Sent::Text(text.to_string()));
        Ok(())
    }

    fn send_binary(&mut self, data: Bytes) -> Result<()> {
        if !self.open {
            return Err(Error::TransportClosed);
        }
        self.state.borrow_mut().sent.push(Sent::Binary(data));
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.borrow_mut().closed += 1;
        }
    }
}
