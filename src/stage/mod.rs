//! # Stage state machine (C3)
//!
//! A session moves through three phases in strict order: [`ContactStage`],
//! [`SessInitStage`], [`SessEstablishedStage`]. [`StageHandler`] drives a
//! heterogeneous ordered list of them over one shared, exclusively-borrowed
//! [`State`], invoking each stage's [`Stage::start`] in turn and stopping at
//! the first error.
//!
//! The spec this module implements describes each stage as exposing a
//! separate `finished()` completion signal distinct from `start()`. Two of
//! the three stages (Contact, SessInit) complete the instant their single
//! message exchange is done, and the third (Established) *is* the rest of
//! the session's lifetime — so the idiomatic shape here collapses
//! `start`/`finished` into one: `start` is an `async fn` whose future
//! resolving **is** the finished signal. `close()` stays a distinct,
//! synchronous operation, realised via a shared [`tokio::sync::watch`]
//! channel every stage selects against at its suspension points, rather
//! than via direct mutation of a running stage from another task.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::CoreError;
use crate::eid::EndpointId;
use crate::wire::{ContactFlags, Message};
use crate::switch::MessageSwitch;

pub mod contact;
pub mod established;
pub mod sess_init;

pub use contact::ContactStage;
pub use established::{EstablishedChannels, SessEstablishedStage};
pub use sess_init::SessInitStage;

/// Which side of the TCPCLv4 connection this session is. Decides who
/// speaks first in each handshake stage (spec.md's Open Question: "active
/// sends first" in every stage, not just Contact).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// This node's advertised parameters, fixed for the life of a session.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub role: Role,
    pub contact_flags: ContactFlags,
    pub keepalive: u16,
    pub segment_mru: u64,
    pub transfer_mru: u64,
    pub local_node_id: EndpointId,
}

/// Values fixed by the SESS_INIT exchange. Written exactly once, by
/// [`SessInitStage`], then read-only for the rest of the session.
#[derive(Debug, Clone)]
pub struct NegotiatedState {
    pub peer_node_id: EndpointId,
    pub keepalive: u16,
    pub segment_mtu: u64,
    pub transfer_mtu: u64,
}

/// Shared state threaded through the pipeline by exclusive mutable
/// reference. `close` is a cloneable receiver so the currently-running
/// stage (and any task it spawns) can select against shutdown.
pub struct State {
    pub config: Configuration,
    pub contact_flags: Option<ContactFlags>,
    pub negotiated: Option<NegotiatedState>,
    pub error: Option<String>,
    pub close_rx: watch::Receiver<bool>,
}

impl State {
    pub fn new(config: Configuration, close_rx: watch::Receiver<bool>) -> Self {
        State {
            config,
            contact_flags: None,
            negotiated: None,
            error: None,
            close_rx,
        }
    }

    fn closing(&self) -> bool {
        *self.close_rx.borrow()
    }
}

/// One phase of the handshake/session pipeline.
#[async_trait]
pub trait Stage: Send {
    /// Drive this stage to completion. Resolving `Ok(())` means the handler
    /// should proceed to the next stage; `Err` aborts the pipeline.
    async fn start(&mut self, switch: &mut MessageSwitch, state: &mut State) -> Result<(), CoreError>;

    /// Pre-emptive, synchronous shutdown hint. Most stages rely entirely on
    /// `state.close_rx` observed inside `start`; stages owning their own
    /// resources (the Established stage's keepalive ticker) use this to
    /// release them promptly even before `start`'s select wakes up.
    fn close(&mut self) {}
}

type Hook = Box<dyn FnMut(&mut State) + Send>;

struct StageEntry {
    stage: Box<dyn Stage>,
    pre_hook: Option<Hook>,
    post_hook: Option<Hook>,
}

/// Drives an ordered list of [`Stage`]s over one shared [`State`].
pub struct StageHandler {
    entries: Vec<StageEntry>,
    close_tx: watch::Sender<bool>,
}

impl StageHandler {
    pub fn new(close_tx: watch::Sender<bool>) -> Self {
        StageHandler {
            entries: Vec::new(),
            close_tx,
        }
    }

    pub fn push(&mut self, stage: Box<dyn Stage>) {
        self.entries.push(StageEntry {
            stage,
            pre_hook: None,
            post_hook: None,
        });
    }

    /// Same as [`StageHandler::push`] but with hooks the handler invokes
    /// immediately before/after this stage's `start`.
    pub fn push_with_hooks(
        &mut self,
        stage: Box<dyn Stage>,
        pre_hook: Option<Hook>,
        post_hook: Option<Hook>,
    ) {
        self.entries.push(StageEntry {
            stage,
            pre_hook,
            post_hook,
        });
    }

    /// Run every stage in order. Stops and returns the first error; a
    /// Established stage error (the common case, since it's the last stage
    /// and only ever exits on fault or close) is what ultimately propagates
    /// out of a running session.
    pub async fn run(&mut self, switch: &mut MessageSwitch, state: &mut State) -> Result<(), CoreError> {
        for entry in &mut self.entries {
            if let Some(hook) = entry.pre_hook.as_mut() {
                hook(state);
            }
            let result = entry.stage.start(switch, state).await;
            if let Some(hook) = entry.post_hook.as_mut() {
                hook(state);
            }
            if let Err(e) = result {
                state.error = Some(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Signal every stage to shut down and invoke each's synchronous
    /// `close()`. Idempotent: sending `true` twice on a watch channel is a
    /// harmless no-op the second time.
    pub fn close(&mut self) {
        let _ = self.close_tx.send(true);
        for entry in &mut self.entries {
            entry.stage.close();
        }
    }
}

/// Receive the next message off `switch`, racing its error channel so a
/// reader/writer fault surfaces immediately instead of waiting for
/// `incoming` to merely close.
pub(crate) async fn next_message(switch: &mut MessageSwitch) -> Result<Message, CoreError> {
    tokio::select! {
        biased;
        err = switch.errors.recv() => Err(err.unwrap_or(CoreError::StageClose)),
        msg = switch.incoming.recv() => msg.ok_or_else(|| {
            CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "message switch incoming channel closed",
            ))
        }),
    }
}

/// Send a message, treating a closed outgoing channel as a stage close.
pub(crate) async fn send_message(switch: &MessageSwitch, message: Message) -> Result<(), CoreError> {
    switch
        .outgoing
        .send(message)
        .await
        .map_err(|_| CoreError::StageClose)
}
