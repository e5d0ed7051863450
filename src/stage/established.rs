//! SessEstablishedStage: the steady-state pump. Runs for the life of the
//! session, ticking a keepalive, filtering the switch's message stream, and
//! exposing its own channels to the transfer manager (C5).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{NegotiatedState, Stage, State};
use crate::error::CoreError;
use crate::keepalive::KeepaliveTicker;
use crate::switch::MessageSwitch;
use crate::wire::{
    Keepalive, Message, MsgReject, RejectReasonCode, SessTerm, SessTermFlags, SessTermReasonCode,
};

/// The pair of channels C5 uses to exchange `Message`s with this stage.
/// Constructed alongside the stage itself, so a caller can hand these to
/// the transfer manager before the stage's `start` ever begins its pump
/// loop (and thus before there's any message traffic to miss).
pub struct EstablishedChannels {
    /// Messages the stage has already filtered (KEEPALIVE swallowed,
    /// SESS_INIT rejected) and forwarded up to C5.
    pub incoming: mpsc::Receiver<Message>,
    /// Messages C5 wants written to the peer.
    pub outgoing: mpsc::Sender<Message>,
}

pub struct SessEstablishedStage {
    negotiated: NegotiatedState,
    to_transfer_manager: mpsc::Sender<Message>,
    from_transfer_manager: mpsc::Receiver<Message>,
    ticker: KeepaliveTicker,
}

impl SessEstablishedStage {
    /// `negotiated` must already be recorded in `State` by `SessInitStage`
    /// before this stage starts; it's passed explicitly here (rather than
    /// re-read from `State`) so the channel-constructing half of this
    /// function doesn't need the handshake to have happened yet.
    pub fn new(negotiated: NegotiatedState) -> (Self, EstablishedChannels) {
        let (to_tm_tx, to_tm_rx) = mpsc::channel(64);
        let (from_tm_tx, from_tm_rx) = mpsc::channel(64);
        let stage = SessEstablishedStage {
            negotiated,
            to_transfer_manager: to_tm_tx,
            from_transfer_manager: from_tm_rx,
            ticker: KeepaliveTicker::new(),
        };
        let channels = EstablishedChannels {
            incoming: to_tm_rx,
            outgoing: from_tm_tx,
        };
        (stage, channels)
    }
}

#[async_trait]
impl Stage for SessEstablishedStage {
    async fn start(&mut self, switch: &mut MessageSwitch, state: &mut State) -> Result<(), CoreError> {
        let keepalive = Duration::from_secs(self.negotiated.keepalive as u64);
        let mut last_receive = Instant::now();
        let mut last_send = Instant::now();

        if !keepalive.is_zero() {
            self.ticker.reschedule(keepalive / 2);
        }

        loop {
            tokio::select! {
                biased;

                _ = state.close_rx.changed() => {
                    return Err(CoreError::StageClose);
                }

                err = switch.errors.recv() => {
                    let err = err.unwrap_or(CoreError::StageClose);
                    if let CoreError::UnknownMessageType(code) = err {
                        let _ = switch.outgoing.send(Message::MsgReject(MsgReject {
                            reason: RejectReasonCode::TypeUnknown,
                            rejected_header: code,
                        })).await;
                        return Err(CoreError::Protocol(format!(
                            "rejected unknown message type {code:#x}"
                        )));
                    }
                    return Err(err);
                }

                tick = self.ticker.ticks.recv(), if !keepalive.is_zero() => {
                    let _ = tick;
                    self.handle_tick(switch, keepalive, last_receive, &mut last_send).await?;
                }

                maybe_message = switch.incoming.recv() => {
                    let message = maybe_message.ok_or_else(|| CoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "message switch incoming channel closed",
                    )))?;
                    last_receive = Instant::now();
                    self.dispatch_inbound(message).await?;
                }

                maybe_outbound = self.from_transfer_manager.recv() => {
                    let Some(message) = maybe_outbound else {
                        // transfer manager dropped its sender; nothing more
                        // to forward, but the session stays up for inbound
                        // traffic until closed or stalled.
                        continue;
                    };
                    switch.outgoing.send(message).await.map_err(|_| CoreError::StageClose)?;
                    last_send = Instant::now();
                }
            }
        }
    }

    fn close(&mut self) {
        self.ticker.stop();
    }
}

impl SessEstablishedStage {
    async fn dispatch_inbound(&mut self, message: Message) -> Result<(), CoreError> {
        match message {
            Message::Keepalive(Keepalive) => {
                trace!("keepalive received");
                Ok(())
            }
            Message::SessInit(_) => Err(CoreError::Protocol(
                "SESS_INIT received after Established".into(),
            )),
            other => self
                .to_transfer_manager
                .send(other)
                .await
                .map_err(|_| CoreError::StageClose),
        }
    }

    async fn handle_tick(
        &mut self,
        switch: &mut MessageSwitch,
        keepalive: Duration,
        last_receive: Instant,
        last_send: &mut Instant,
    ) -> Result<(), CoreError> {
        let now = Instant::now();
        if now.saturating_duration_since(last_receive) > keepalive {
            warn!("session stalled: no data received within the keepalive interval");
            let _ = switch
                .outgoing
                .send(Message::SessTerm(SessTerm {
                    flags: SessTermFlags::empty(),
                    reason: SessTermReasonCode::IdleTimeout,
                }))
                .await;
            return Err(CoreError::Stalled);
        }

        let since_send = now.saturating_duration_since(*last_send);
        if keepalive.saturating_sub(since_send) <= keepalive / 8 {
            switch
                .outgoing
                .send(Message::Keepalive(Keepalive))
                .await
                .map_err(|_| CoreError::StageClose)?;
            *last_send = now;
            debug!("keepalive sent");
            self.ticker.reschedule(keepalive / 2);
        } else {
            let remaining_slack = keepalive.saturating_sub(since_send);
            self.ticker.reschedule(remaining_slack / 2);
        }
        Ok(())
    }
}
