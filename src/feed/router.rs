// src/feed/router.rs - Multiplex router
//
// Owns the channel registry and turns transport messages into channel operations:
// - Text frames: control envelopes (SUBSCRIBE ack -> sink init, QUERY/ERROR -> report)
// - Binary frames: channel id prefix -> frame queue of that channel
// - Sink signals: validated against the channel token, then fed to the feeder
//
// Failures never call back into the supervisor. They come back as RouterActions,
// the supervisor decides how to recover.

use crate::error::Error;
use crate::feed::channel::{ChannelFeeder, ChannelState, ChannelStats, ChannelToken, EnqueueResult};
use crate::feed::config::FeedConfig;
use crate::feed::protocol::{
    decode_binary, mime_type, ChannelId, ChannelMode, ControlMessage, MessageType, SINGLE_CHANNEL_ID,
};
use crate::feed::sink::{SinkFactory, SinkNotifier, SinkSignal};
use crate::feed::supervisor::{FeedEvent, Subscription, SupervisorEvent};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;

/// What the supervisor must do after the router handled an input.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    /// Unsubscribe and subscribe again for this channel only.
    ResetChannel(ChannelId),
    /// Close and reopen the transport, replaying every subscription.
    ResetConnection,
    /// Report to observers.
    Notify(FeedEvent),
}

pub struct MultiplexRouter {
    mode: ChannelMode,
    config: FeedConfig,
    channels: HashMap<ChannelId, ChannelFeeder>,
    /// Last generation handed out per channel id, survives unsubscribe
    generations: HashMap<ChannelId, u32>,
    sink_factory: Box<dyn SinkFactory>,
    events: crossbeam_channel::Sender<SupervisorEvent>,
}

impl MultiplexRouter {
    pub fn new(
        config: FeedConfig,
        sink_factory: Box<dyn SinkFactory>,
        events: crossbeam_channel::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            mode: config.mode,
            config,
            channels: HashMap::new(),
            generations: HashMap::new(),
            sink_factory,
            events,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self, channel: ChannelId) -> Option<ChannelStats> {
        self.channels.get(&channel).map(|feeder| feeder.stats())
    }

    #[cfg(test)]
    pub(crate) fn channel(&self, channel: ChannelId) -> Option<&ChannelFeeder> {
        self.channels.get(&channel)
    }

    /// Channel id a subscription resolves to under the current mode.
    pub fn resolve(&self, subscription: &Subscription) -> ChannelId {
        self.mode.resolve(subscription.channel)
    }

    fn wire_channel(&self, channel: ChannelId) -> Option<ChannelId> {
        match self.mode {
            ChannelMode::Single => None,
            ChannelMode::Multiplexed => Some(channel),
        }
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Create (or replace) the local channel entry and serialize the SUBSCRIBE request.
    pub fn subscribe(&mut self, subscription: &Subscription) -> crate::error::Result<String> {
        let id = self.resolve(subscription);
        if let Some(mut previous) = self.channels.remove(&id) {
            debug!("Channel {} subscribed again, replacing previous entry", id);
            previous.terminate();
        }

        let generation = self.generations.entry(id).or_insert(0);
        *generation = generation.wrapping_add(1);
        let token = ChannelToken::new(id, *generation);

        self.channels
            .insert(id, ChannelFeeder::new(token, subscription.target.as_str(), &self.config));

        ControlMessage::subscribe(self.wire_channel(id), subscription.params.as_str()).to_text()
    }

    /// Drop the local channel entry and serialize the UNSUBSCRIBE request.
    ///
    /// Returns `None` for a channel that is not subscribed.
    pub fn unsubscribe(&mut self, channel: ChannelId) -> crate::error::Result<Option<String>> {
        let channel = self.mode.resolve(channel);
        let Some(mut feeder) = self.channels.remove(&channel) else {
            debug!("Channel {} not subscribed, unsubscribe ignored", channel);
            return Ok(None);
        };
        feeder.terminate();
        info!("Channel {} unsubscribed", channel);

        ControlMessage::unsubscribe(self.wire_channel(channel))
            .to_text()
            .map(Some)
    }

    pub fn query(&self, content: &str) -> crate::error::Result<String> {
        ControlMessage::query(None, content).to_text()
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    pub fn handle_text(&mut self, text: &str) -> Vec<RouterAction> {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                let codec = text.trim();
                // Single-stream servers send the bare codec string
                if self.mode == ChannelMode::Single && !codec.is_empty() {
                    return self.start_channel(SINGLE_CHANNEL_ID, codec);
                }
                debug!("Dropping unparseable control message: {}", e);
                return Vec::new();
            }
        };

        let channel = message.channel_for(self.mode);
        let content = message.content_text();
        match message.message_type {
            MessageType::Subscribe => {
                let Some(id) = channel else {
                    debug!("SUBSCRIBE acknowledgement without channel id dropped");
                    return Vec::new();
                };
                self.start_channel(id, &content)
            }
            MessageType::Query => vec![RouterAction::Notify(FeedEvent::Query {
                channel: message.channel,
                content,
            })],
            MessageType::Error => {
                warn!("Remote error on channel {:?}: {}", message.channel, content);
                vec![RouterAction::Notify(FeedEvent::RemoteError {
                    channel: message.channel,
                    content,
                })]
            }
            MessageType::Unsubscribe => {
                debug!("UNSUBSCRIBE echo for channel {:?} ignored", message.channel);
                Vec::new()
            }
            MessageType::Unknown => vec![RouterAction::Notify(FeedEvent::Message {
                channel: message.channel,
                content,
            })],
        }
    }

    pub fn handle_binary(&mut self, frame: Bytes) -> Vec<RouterAction> {
        let (id, chunk) = match decode_binary(frame, self.mode) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{}", e);
                return Vec::new();
            }
        };

        let Some(feeder) = self.channels.get_mut(&id) else {
            debug!("{}, dropping {} bytes", Error::UnknownChannel(id), chunk.len());
            return Vec::new();
        };
        if chunk.is_empty() {
            debug!("Channel {} empty chunk dropped", id);
            return Vec::new();
        }

        match feeder.push_chunk(chunk) {
            Ok(EnqueueResult::Queued) => Vec::new(),
            Ok(EnqueueResult::Evicted(count)) => {
                vec![RouterAction::Notify(FeedEvent::ChunksDropped { channel: id, count })]
            }
            Ok(EnqueueResult::Discarded) => {
                if feeder.state().accepts_chunks() {
                    vec![RouterAction::Notify(FeedEvent::ChunksDropped { channel: id, count: 1 })]
                } else {
                    Vec::new()
                }
            }
            Err(e) => self.on_channel_error(id, e),
        }
    }

    pub fn handle_sink_signal(&mut self, token: ChannelToken, signal: SinkSignal) -> Vec<RouterAction> {
        let Some(feeder) = self.channels.get_mut(&token.id) else {
            debug!("Sink signal {:?} for removed channel {}", signal, token.id);
            return Vec::new();
        };
        if feeder.token() != token {
            debug!(
                "Stale sink signal {:?} for channel {} (generation {}, current {})",
                signal,
                token.id,
                token.generation,
                feeder.token().generation
            );
            return Vec::new();
        }

        let result = match signal {
            SinkSignal::SourceOpen => feeder.on_source_open(),
            SinkSignal::UpdateEnd => feeder.on_update_end(),
            SinkSignal::Error(reason) => feeder.on_sink_error(&reason),
        };
        match result {
            Ok(()) => Vec::new(),
            Err(e) => self.on_channel_error(token.id, e),
        }
    }

    /// Fail channels whose sink has not completed an operation within the append timeout.
    pub fn check_timeouts(&mut self) -> Vec<RouterAction> {
        let timeout = self.config.append_timeout;
        let wedged: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, feeder)| feeder.is_wedged(timeout))
            .map(|(id, _)| *id)
            .collect();

        let mut actions = Vec::new();
        for id in wedged {
            let Some(feeder) = self.channels.get_mut(&id) else {
                continue;
            };
            warn!("Channel {} sink wedged for more than {:?}", id, timeout);
            let err = feeder.expire();
            actions.extend(self.on_channel_error(id, err));
        }
        actions
    }

    /// Transport lost: every channel waits for a fresh codec acknowledgement.
    pub fn stall_all(&mut self) {
        for feeder in self.channels.values_mut() {
            feeder.stall();
        }
    }

    /// Tear down every channel.
    pub fn clear(&mut self) {
        for (_, mut feeder) in self.channels.drain() {
            feeder.terminate();
        }
    }

    fn start_channel(&mut self, id: ChannelId, codec: &str) -> Vec<RouterAction> {
        let mime = mime_type(&self.config.container, codec);
        let Some(feeder) = self.channels.get_mut(&id) else {
            debug!("Codec {} for unsubscribed channel {} dropped", codec, id);
            return Vec::new();
        };

        let sink = self.sink_factory.create_sink(id, feeder.target());
        let notifier = SinkNotifier::new(feeder.token(), self.events.clone());
        match feeder.init(&mime, sink, notifier) {
            Ok(()) if feeder.state() == ChannelState::Terminated => Vec::new(),
            Ok(()) => vec![RouterAction::Notify(FeedEvent::ChannelStarted { channel: id, mime })],
            Err(e) => self.on_channel_error(id, e),
        }
    }

    fn on_channel_error(&mut self, id: ChannelId, err: Error) -> Vec<RouterAction> {
        match err {
            Error::UnsupportedCodec { channel, mime } => {
                error!("Channel {}: unsupported MIME type or codec: {}", channel, mime);
                vec![RouterAction::Notify(FeedEvent::CodecUnsupported { channel, mime })]
            }
            err if err.is_channel_local() => {
                warn!("{}", err);
                match self.mode {
                    ChannelMode::Single => vec![RouterAction::ResetConnection],
                    ChannelMode::Multiplexed => vec![RouterAction::ResetChannel(id)],
                }
            }
            err => {
                error!("Channel {}: {}", id, err);
                Vec::new()
            }
        }
    }
}
