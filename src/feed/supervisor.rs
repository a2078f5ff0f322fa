// src/feed/supervisor.rs - Connection supervisor and feed event loop
//
// Single-threaded event loop. Every input arrives as a SupervisorEvent on one
// crossbeam queue:
// - Transport events (tagged with the connection generation)
// - Sink signals (tagged with the channel token)
// - Commands from FeedHandles on other threads
//
// The supervisor owns the transport lifecycle, keeps the desired subscriptions
// and replays them whenever a transport opens.

use crate::error::{Error, Result};
use crate::feed::channel::{ChannelStats, ChannelToken};
use crate::feed::config::FeedConfig;
use crate::feed::protocol::{ChannelId, ChannelMode};
use crate::feed::router::{MultiplexRouter, RouterAction};
use crate::feed::sink::{SinkFactory, SinkSignal};
use crate::feed::transport::{Connector, Transport, TransportEvent, TransportEvents};
use crossbeam_channel::{RecvTimeoutError, TrySendError};
use dashmap::DashSet;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUS_INIT: usize = 0;
const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

const POLL_TIMEOUT_MS: u64 = 100;
const FEED_EVENT_CAPACITY: usize = 1024;

/// Input to the feed loop.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Transport { generation: u64, event: TransportEvent },
    Sink { token: ChannelToken, signal: SinkSignal },
    Command(Command),
}

/// Request posted by a [`FeedHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe(Subscription),
    Unsubscribe(ChannelId),
    Reset,
    Query(String),
}

/// A desired channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Ignored in single-channel mode.
    pub channel: ChannelId,
    /// Render target handed to the sink factory.
    pub target: String,
    /// Sent as the SUBSCRIBE content (e.g. the camera URL or name).
    pub params: String,
}

impl Subscription {
    pub fn new(channel: ChannelId, target: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            channel,
            target: target.into(),
            params: params.into(),
        }
    }
}

/// Notification for observers of the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    ChannelStarted { channel: ChannelId, mime: String },
    CodecUnsupported { channel: ChannelId, mime: String },
    /// Answer to a QUERY
    Query { channel: Option<ChannelId>, content: String },
    RemoteError { channel: Option<ChannelId>, content: String },
    /// Envelope of a type the feed does not handle
    Message { channel: Option<ChannelId>, content: String },
    /// Channel unsubscribed and subscribed again after a failure
    ChannelReset { channel: ChannelId },
    ChunksDropped { channel: ChannelId, count: usize },
    ConnectionOpened,
    ConnectionClosed { reason: Option<String> },
    ConnectionReset,
}

/// Connection supervisor.
///
/// Drive it with [`run`](ConnectionSupervisor::run) on a dedicated thread, or call
/// [`poll`](ConnectionSupervisor::poll) from an existing loop.
pub struct ConnectionSupervisor {
    url: String,
    config: FeedConfig,
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    /// Bumped on every open/close, events from older transports are ignored
    generation: u64,
    connected: bool,
    router: MultiplexRouter,
    subscriptions: BTreeMap<ChannelId, Subscription>,
    event_sender: crossbeam_channel::Sender<SupervisorEvent>,
    event_receiver: crossbeam_channel::Receiver<SupervisorEvent>,
    feed_sender: crossbeam_channel::Sender<FeedEvent>,
    feed_receiver: crossbeam_channel::Receiver<FeedEvent>,
    active_channels: Arc<DashSet<ChannelId>>,
    status: Arc<AtomicUsize>,
    reconnect_at: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    fn new(
        url: String,
        config: FeedConfig,
        connector: Box<dyn Connector>,
        sink_factory: Box<dyn SinkFactory>,
    ) -> Self {
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();
        let (feed_sender, feed_receiver) = crossbeam_channel::bounded(FEED_EVENT_CAPACITY);
        let router = MultiplexRouter::new(config.clone(), sink_factory, event_sender.clone());

        Self {
            url,
            config,
            connector,
            transport: None,
            generation: 0,
            connected: false,
            router,
            subscriptions: BTreeMap::new(),
            event_sender,
            event_receiver,
            feed_sender,
            feed_receiver,
            active_channels: Arc::new(DashSet::new()),
            status: Arc::new(AtomicUsize::new(STATUS_INIT)),
            reconnect_at: None,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.config.mode
    }

    /// True once the current transport reported it is open.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }

    /// Receiver for feed notifications. Events are dropped when nobody drains it.
    pub fn feed_events(&self) -> crossbeam_channel::Receiver<FeedEvent> {
        self.feed_receiver.clone()
    }

    pub fn stats(&self, channel: ChannelId) -> Option<ChannelStats> {
        self.router.stats(channel)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Cloneable handle for other threads.
    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            sender: self.event_sender.clone(),
            status: self.status.clone(),
            active_channels: self.active_channels.clone(),
            mode: self.config.mode,
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open a new transport, closing the current one first.
    ///
    /// Subscriptions are replayed once the transport reports it is open.
    pub fn open(&mut self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SupervisorStopped);
        }
        self.drop_transport();
        self.reconnect_at = None;

        let events = TransportEvents::new(self.generation, self.event_sender.clone());
        match self.connector.connect(&self.url, events) {
            Ok(transport) => {
                info!("Connecting to {} (generation {})", self.url, self.generation);
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.url, e);
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close the transport. Channels stay registered and wait for the next open.
    pub fn close(&mut self) {
        let had_transport = self.transport.is_some();
        self.drop_transport();
        self.reconnect_at = None;
        self.router.stall_all();
        if had_transport {
            info!("Connection to {} closed", self.url);
            self.emit(FeedEvent::ConnectionClosed { reason: None });
        }
    }

    /// Close and reopen the connection, replaying every subscription.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting connection to {}", self.url);
        self.close();
        self.emit(FeedEvent::ConnectionReset);
        self.open()
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.generation = self.generation.wrapping_add(1);
        self.connected = false;
    }

    fn on_transport_lost(&mut self, reason: Option<String>) {
        match &reason {
            Some(reason) => warn!("Connection to {} failed: {}", self.url, reason),
            None => info!("Connection to {} closed by peer", self.url),
        }
        self.drop_transport();
        self.router.stall_all();
        self.emit(FeedEvent::ConnectionClosed { reason });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.config.auto_reconnect && !self.is_stopped() {
            debug!("Reconnecting in {:?}", self.config.reconnect_delay);
            self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }

    fn on_transport_opened(&mut self) {
        info!("Connected to {}", self.url);
        self.connected = true;
        self.emit(FeedEvent::ConnectionOpened);

        let replay: Vec<Subscription> = self.subscriptions.values().cloned().collect();
        for subscription in replay {
            if let Err(e) = self.send_subscribe(&subscription) {
                warn!("Failed to replay subscription for channel {}: {}", subscription.channel, e);
            }
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&mut self, subscription: Subscription) -> Result<()> {
        let id = self.router.resolve(&subscription);
        if self.config.mode == ChannelMode::Single {
            self.subscriptions.clear();
            self.active_channels.clear();
        }
        self.subscriptions.insert(id, subscription.clone());
        self.active_channels.insert(id);
        self.send_subscribe(&subscription)
    }

    /// Idempotent: unsubscribing an unknown channel does nothing.
    pub fn unsubscribe(&mut self, channel: ChannelId) -> Result<()> {
        let channel = self.config.mode.resolve(channel);
        self.subscriptions.remove(&channel);
        self.active_channels.remove(&channel);
        match self.router.unsubscribe(channel)? {
            Some(text) => self.send_if_connected(&text),
            None => Ok(()),
        }
    }

    /// Channel-scoped recovery: UNSUBSCRIBE then SUBSCRIBE with the stored parameters.
    pub fn resubscribe(&mut self, channel: ChannelId) -> Result<()> {
        let channel = self.config.mode.resolve(channel);
        let Some(subscription) = self.subscriptions.get(&channel).cloned() else {
            debug!("Channel {} has no subscription to replay", channel);
            return Ok(());
        };
        info!("Resetting channel {}", channel);
        if let Some(text) = self.router.unsubscribe(channel)? {
            self.send_if_connected(&text)?;
        }
        self.send_subscribe(&subscription)?;
        self.emit(FeedEvent::ChannelReset { channel });
        Ok(())
    }

    /// Send a QUERY; the answer arrives as [`FeedEvent::Query`].
    pub fn query(&mut self, content: &str) -> Result<()> {
        let text = self.router.query(content)?;
        if !self.connected {
            return Err(Error::TransportClosed);
        }
        self.send_text(&text)
    }

    fn send_subscribe(&mut self, subscription: &Subscription) -> Result<()> {
        let text = self.router.subscribe(subscription)?;
        self.send_if_connected(&text)
    }

    /// Requests made while disconnected are covered by the replay on open.
    fn send_if_connected(&mut self, text: &str) -> Result<()> {
        if !self.connected {
            debug!("Not connected, deferring {}", text);
            return Ok(());
        }
        self.send_text(text)
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::TransportClosed);
        };
        debug!("Sending {}", text);
        transport.send_text(text)
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Process one event.
    pub fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Transport { generation, event } => {
                if generation != self.generation {
                    debug!(
                        "Ignoring {:?} from stale transport (generation {}, current {})",
                        event, generation, self.generation
                    );
                    return;
                }
                match event {
                    TransportEvent::Opened => self.on_transport_opened(),
                    TransportEvent::Text(text) => {
                        let actions = self.router.handle_text(&text);
                        self.apply(actions);
                    }
                    TransportEvent::Binary(data) => {
                        let actions = self.router.handle_binary(data);
                        self.apply(actions);
                    }
                    TransportEvent::Closed => self.on_transport_lost(None),
                    TransportEvent::Error(reason) => self.on_transport_lost(Some(reason)),
                }
            }
            SupervisorEvent::Sink { token, signal } => {
                let actions = self.router.handle_sink_signal(token, signal);
                self.apply(actions);
            }
            SupervisorEvent::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Subscribe(subscription) => self.subscribe(subscription),
            Command::Unsubscribe(channel) => self.unsubscribe(channel),
            Command::Reset => self.reset(),
            Command::Query(content) => self.query(&content),
        };
        if let Err(e) = result {
            warn!("Command failed: {}", e);
        }
    }

    fn apply(&mut self, actions: Vec<RouterAction>) {
        let mut reset_connection = false;
        for action in actions {
            match action {
                RouterAction::Notify(event) => self.emit(event),
                RouterAction::ResetChannel(channel) => {
                    if let Err(e) = self.resubscribe(channel) {
                        warn!("Failed to reset channel {}: {}", channel, e);
                    }
                }
                RouterAction::ResetConnection => reset_connection = true,
            }
        }
        if reset_connection {
            if let Err(e) = self.reset() {
                error!("Connection reset failed: {}", e);
            }
        }
    }

    /// Fail wedged channels and fire a due reconnect.
    pub fn check_timeouts(&mut self) {
        let actions = self.router.check_timeouts();
        self.apply(actions);

        if let Some(at) = self.reconnect_at {
            if Instant::now() >= at {
                self.reconnect_at = None;
                if let Err(e) = self.open() {
                    debug!("Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    /// Wait up to `timeout` for events and process everything queued.
    ///
    /// Returns the number of events processed.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize> {
        if self.is_stopped() {
            return Err(Error::SupervisorStopped);
        }
        Ok(self.poll_events(timeout))
    }

    fn poll_events(&mut self, timeout: Duration) -> usize {
        let mut processed = 0;
        match self.event_receiver.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                processed += 1;
                while let Ok(event) = self.event_receiver.try_recv() {
                    self.handle_event(event);
                    processed += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Unreachable while the supervisor holds a sender
            Err(RecvTimeoutError::Disconnected) => {}
        }
        self.check_timeouts();
        processed
    }

    /// Open the transport (if needed) and process events until stopped.
    pub fn run(&mut self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SupervisorStopped);
        }
        self.status.store(STATUS_RUN, Ordering::Release);
        info!("Feed supervisor started");

        if self.transport.is_none() {
            if let Err(e) = self.open() {
                if self.reconnect_at.is_none() {
                    self.status.store(STATUS_END, Ordering::Release);
                    return Err(e);
                }
            }
        }

        let poll_timeout = Duration::from_millis(POLL_TIMEOUT_MS);
        loop {
            if self.is_stopped() {
                info!("Feed supervisor received stop signal");
                break;
            }
            self.poll_events(poll_timeout);
        }

        self.shutdown();
        info!("Feed supervisor stopped");
        Ok(())
    }

    /// Stop the loop and release the transport and every channel.
    pub fn stop(&mut self) {
        self.status.store(STATUS_END, Ordering::Release);
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.drop_transport();
        self.reconnect_at = None;
        self.router.clear();
        self.active_channels.clear();
    }

    fn emit(&self, event: FeedEvent) {
        match self.feed_sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Feed event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Cross-thread handle to a [`ConnectionSupervisor`].
#[derive(Clone)]
pub struct FeedHandle {
    sender: crossbeam_channel::Sender<SupervisorEvent>,
    status: Arc<AtomicUsize>,
    active_channels: Arc<DashSet<ChannelId>>,
    mode: ChannelMode,
}

impl FeedHandle {
    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.post(Command::Subscribe(subscription))
    }

    pub fn unsubscribe(&self, channel: ChannelId) -> Result<()> {
        self.post(Command::Unsubscribe(channel))
    }

    pub fn reset(&self) -> Result<()> {
        self.post(Command::Reset)
    }

    pub fn query(&self, content: impl Into<String>) -> Result<()> {
        self.post(Command::Query(content.into()))
    }

    /// Ask the loop to stop. [`run`](ConnectionSupervisor::run) returns after closing the transport.
    pub fn stop(&self) {
        self.status.store(STATUS_END, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_END
    }

    /// Whether the supervisor holds a subscription for `channel`.
    pub fn is_subscribed(&self, channel: ChannelId) -> bool {
        self.active_channels.contains(&self.mode.resolve(channel))
    }

    pub fn subscribed_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.active_channels.iter().map(|id| *id).collect();
        channels.sort_unstable();
        channels
    }

    fn post(&self, command: Command) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SupervisorStopped);
        }
        self.sender
            .send(SupervisorEvent::Command(command))
            .map_err(|_| Error::SupervisorStopped)
    }
}

/// Builder for [`ConnectionSupervisor`].
///
/// # Required Parameters
///
/// - `url`: transport address
/// - `connector`: opens transports
/// - `sink_factory`: creates one sink per channel
///
/// `config` defaults to [`FeedConfig::multiplexed`].
///
/// # Example
///
/// ```rust,ignore
/// let mut supervisor = ConnectionSupervisor::builder()
///     .url("ws://localhost:8080/live")
///     .config(FeedConfig::multiplexed())
///     .connector(WsConnector::new())
///     .sink_factory(|channel, target: &str| make_sink(channel, target))
///     .build()?;
///
/// supervisor.subscribe(Subscription::new(1, "video1", "rtsp://camera-1/stream"))?;
/// supervisor.run()?;
/// ```
#[derive(Default)]
pub struct SupervisorBuilder {
    url: Option<String>,
    config: Option<FeedConfig>,
    connector: Option<Box<dyn Connector>>,
    sink_factory: Option<Box<dyn SinkFactory>>,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn config(mut self, config: FeedConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn sink_factory(mut self, factory: impl SinkFactory + 'static) -> Self {
        self.sink_factory = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Result<ConnectionSupervisor> {
        let url = self.url.ok_or(Error::MissingParameter("url"))?;
        let connector = self.connector.ok_or(Error::MissingParameter("connector"))?;
        let sink_factory = self
            .sink_factory
            .ok_or(Error::MissingParameter("sink_factory"))?;
        let config = self.config.unwrap_or_default();

        Ok(ConnectionSupervisor::new(url, config, connector, sink_factory))
    }
}
