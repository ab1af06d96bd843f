//! # Pipeline
//!
//! An ordered list of stages converting between wire bytes and messages.
//! The stage list is built once and shared; every exchange runs through a
//! fresh [`PipelineSession`] whose [`StageContext`] carries the cursor, the
//! remote endpoint and any user events raised along the way.
//!
//! ```text
//! read:  Bytes ──► codec ──► network filter ──► fault logger ──► Message
//! write: Message ─► codec ──► network filter ──► fault logger ──► Bytes
//! ```
//!
//! A stage either forwards an item to the next stage (`Step::Next`) or ends
//! the exchange (`Step::Halt`). A stage error is handed to the first stage
//! after the failing one that handles faults, then returned to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use dht_telemetry::{metric_inc, DECODE_FAULTS};
use dht_wire::{decode_message, encode_message, Message};

use crate::config::Transport;
use crate::error::PipelineError;

/// What flows between stages.
#[derive(Debug, Clone)]
pub enum Item {
    Bytes(Bytes),
    Message(Message),
}

impl Item {
    fn kind(&self) -> &'static str {
        match self {
            Item::Bytes(_) => "bytes",
            Item::Message(_) => "message",
        }
    }
}

/// Outcome of one stage.
#[derive(Debug)]
pub enum Step {
    Next(Item),
    Halt,
}

/// Out-of-band events raised by stages during one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A message from another network was dropped.
    ForeignNetwork { expected: i32, actual: i32 },
}

/// One encode/decode step.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn inbound(&self, _ctx: &mut StageContext, item: Item) -> Result<Step, PipelineError> {
        Ok(Step::Next(item))
    }

    fn outbound(&self, _ctx: &mut StageContext, item: Item) -> Result<Step, PipelineError> {
        Ok(Step::Next(item))
    }

    /// Whether faults raised by earlier stages are delivered here.
    fn handles_faults(&self) -> bool {
        false
    }

    fn exception_caught(&self, _ctx: &StageContext, _error: &PipelineError) {}

    fn user_event(&self, _ctx: &StageContext, _event: &PipelineEvent) {}
}

/// Per-exchange state.
#[derive(Debug)]
pub struct StageContext {
    cursor: usize,
    transport: Transport,
    remote: Option<SocketAddr>,
    events: Vec<PipelineEvent>,
}

impl StageContext {
    fn new(transport: Transport) -> Self {
        Self {
            cursor: 0,
            transport,
            remote: None,
            events: Vec::new(),
        }
    }

    /// Index of the stage currently running.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Record an event; every stage sees it once the exchange ends.
    pub fn fire_user_event(&mut self, event: PipelineEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }
}

/// Shared, immutable stage list.
pub struct Pipeline {
    transport: Transport,
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(transport: Transport, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { transport, stages }
    }

    /// Codec, network filter and fault logger.
    pub fn standard(transport: Transport, p2p_id: i32, max_message_bytes: usize) -> Arc<Self> {
        Arc::new(Self::new(
            transport,
            vec![
                Arc::new(MessageCodecStage::new(max_message_bytes)),
                Arc::new(NetworkFilterStage::new(p2p_id)),
                Arc::new(FaultLoggerStage),
            ],
        ))
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Fresh session for one exchange.
    pub fn session(self: &Arc<Self>) -> PipelineSession {
        PipelineSession {
            pipeline: Arc::clone(self),
            ctx: StageContext::new(self.transport),
        }
    }
}

/// Runs one exchange through a pipeline. Not reused across exchanges.
pub struct PipelineSession {
    pipeline: Arc<Pipeline>,
    ctx: StageContext,
}

impl PipelineSession {
    #[must_use]
    pub fn with_remote(mut self, remote: Option<SocketAddr>) -> Self {
        self.ctx.remote = remote;
        self
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Bytes in, message out. `Ok(None)` means a stage halted the exchange.
    pub fn read(&mut self, bytes: Bytes) -> Result<Option<Message>, PipelineError> {
        match self.run(Item::Bytes(bytes), true)? {
            None => Ok(None),
            Some(Item::Message(message)) => Ok(Some(message)),
            Some(other) => Err(PipelineError::Incomplete {
                expected: "message",
                produced: other.kind(),
            }),
        }
    }

    /// Message in, bytes out.
    pub fn write(&mut self, message: Message) -> Result<Option<Bytes>, PipelineError> {
        match self.run(Item::Message(message), false)? {
            None => Ok(None),
            Some(Item::Bytes(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(PipelineError::Incomplete {
                expected: "bytes",
                produced: other.kind(),
            }),
        }
    }

    fn run(&mut self, item: Item, inbound: bool) -> Result<Option<Item>, PipelineError> {
        let stages = Arc::clone(&self.pipeline);
        let mut current = item;
        self.ctx.cursor = 0;

        let outcome = loop {
            let Some(stage) = stages.stages.get(self.ctx.cursor) else {
                break Ok(Some(current));
            };
            let step = if inbound {
                stage.inbound(&mut self.ctx, current)
            } else {
                stage.outbound(&mut self.ctx, current)
            };
            match step {
                Ok(Step::Next(next)) => {
                    current = next;
                    self.ctx.cursor += 1;
                }
                Ok(Step::Halt) => break Ok(None),
                Err(error) => {
                    self.fire_exception_caught(&stages, &error);
                    break Err(error);
                }
            }
        };

        self.deliver_events(&stages);
        outcome
    }

    fn fire_exception_caught(&self, pipeline: &Pipeline, error: &PipelineError) {
        let handler = pipeline
            .stages
            .iter()
            .skip(self.ctx.cursor + 1)
            .find(|stage| stage.handles_faults());
        match handler {
            Some(stage) => stage.exception_caught(&self.ctx, error),
            None => debug!(stage = error.stage(), %error, "Unhandled pipeline fault"),
        }
    }

    fn deliver_events(&self, pipeline: &Pipeline) {
        for event in &self.ctx.events {
            for stage in &pipeline.stages {
                stage.user_event(&self.ctx, event);
            }
        }
    }
}

// =============================================================================
// STAGES
// =============================================================================

/// Bytes <-> `Message`. Stamps decoded messages with the observed remote.
pub struct MessageCodecStage {
    max_message_bytes: usize,
}

impl MessageCodecStage {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    fn fault(source: dht_wire::WireError) -> PipelineError {
        PipelineError::Codec {
            stage: "codec",
            source,
        }
    }
}

impl Stage for MessageCodecStage {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn inbound(&self, ctx: &mut StageContext, item: Item) -> Result<Step, PipelineError> {
        match item {
            Item::Bytes(bytes) => {
                let mut message = decode_message(bytes).map_err(Self::fault)?;
                message.observed_remote = ctx.remote();
                Ok(Step::Next(Item::Message(message)))
            }
            other => Ok(Step::Next(other)),
        }
    }

    fn outbound(&self, _ctx: &mut StageContext, item: Item) -> Result<Step, PipelineError> {
        match item {
            Item::Message(message) => {
                let bytes = encode_message(&message).map_err(Self::fault)?;
                if bytes.len() > self.max_message_bytes {
                    return Err(Self::fault(dht_wire::WireError::Oversized {
                        size: bytes.len(),
                        max: self.max_message_bytes,
                    }));
                }
                Ok(Step::Next(Item::Bytes(bytes)))
            }
            other => Ok(Step::Next(other)),
        }
    }
}

/// Drops inbound messages that belong to another network.
pub struct NetworkFilterStage {
    p2p_id: i32,
}

impl NetworkFilterStage {
    pub fn new(p2p_id: i32) -> Self {
        Self { p2p_id }
    }
}

impl Stage for NetworkFilterStage {
    fn name(&self) -> &'static str {
        "network-filter"
    }

    fn inbound(&self, ctx: &mut StageContext, item: Item) -> Result<Step, PipelineError> {
        if let Item::Message(message) = &item {
            if message.p2p_id != self.p2p_id {
                ctx.fire_user_event(PipelineEvent::ForeignNetwork {
                    expected: self.p2p_id,
                    actual: message.p2p_id,
                });
                return Ok(Step::Halt);
            }
        }
        Ok(Step::Next(item))
    }
}

/// Terminal fault handler: logs and counts decode faults.
pub struct FaultLoggerStage;

impl Stage for FaultLoggerStage {
    fn name(&self) -> &'static str {
        "fault-logger"
    }

    fn handles_faults(&self) -> bool {
        true
    }

    fn exception_caught(&self, ctx: &StageContext, error: &PipelineError) {
        metric_inc!(DECODE_FAULTS, &[ctx.transport().as_str()]);
        warn!(
            stage = error.stage(),
            transport = %ctx.transport(),
            remote = ?ctx.remote(),
            %error,
            "Pipeline fault"
        );
    }

    fn user_event(&self, ctx: &StageContext, event: &PipelineEvent) {
        debug!(remote = ?ctx.remote(), ?event, "Pipeline event");
    }
}
