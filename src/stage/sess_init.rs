//! SessInitStage: SESS_INIT exchange and parameter negotiation. Ordering
//! mirrors ContactStage's active/passive rule (spec's resolved Open
//! Question: the active peer always speaks first).

use async_trait::async_trait;
use tracing::debug;

use super::{next_message, send_message, NegotiatedState, Role, Stage, State};
use crate::error::CoreError;
use crate::switch::MessageSwitch;
use crate::wire::{Message, SessInit};

#[derive(Debug, Default)]
pub struct SessInitStage;

impl SessInitStage {
    pub fn new() -> Self {
        SessInitStage
    }
}

#[async_trait]
impl Stage for SessInitStage {
    async fn start(&mut self, switch: &mut MessageSwitch, state: &mut State) -> Result<(), CoreError> {
        let local = SessInit {
            keepalive: state.config.keepalive,
            segment_mru: state.config.segment_mru,
            transfer_mru: state.config.transfer_mru,
            node_id: state.config.local_node_id.clone(),
        };

        let peer = tokio::select! {
            biased;
            _ = state.close_rx.changed() => return Err(CoreError::StageClose),
            result = run_exchange(switch, state.config.role, local) => result?,
        };

        let negotiated = NegotiatedState {
            peer_node_id: peer.node_id,
            keepalive: state.config.keepalive.min(peer.keepalive),
            segment_mtu: state.config.segment_mru.min(peer.segment_mru),
            transfer_mtu: state.config.transfer_mru.min(peer.transfer_mru),
        };
        if negotiated.segment_mtu == 0 || negotiated.transfer_mtu == 0 {
            return Err(CoreError::Negotiation(format!(
                "peer advertised a zero MRU (segment_mru={}, transfer_mru={})",
                peer.segment_mru, peer.transfer_mru
            )));
        }
        debug!(
            keepalive = negotiated.keepalive,
            segment_mtu = negotiated.segment_mtu,
            transfer_mtu = negotiated.transfer_mtu,
            peer = %negotiated.peer_node_id,
            "session parameters negotiated"
        );
        state.negotiated = Some(negotiated);
        Ok(())
    }
}

async fn run_exchange(switch: &mut MessageSwitch, role: Role, local: SessInit) -> Result<SessInit, CoreError> {
    match role {
        Role::Active => {
            send_message(switch, Message::SessInit(local)).await?;
            receive_sess_init(switch).await
        }
        Role::Passive => {
            let peer = receive_sess_init(switch).await?;
            send_message(switch, Message::SessInit(local)).await?;
            Ok(peer)
        }
    }
}

async fn receive_sess_init(switch: &mut MessageSwitch) -> Result<SessInit, CoreError> {
    match next_message(switch).await? {
        Message::SessInit(init) => Ok(init),
        Message::SessTerm(term) => Err(CoreError::Protocol(format!(
            "peer terminated session during SESS_INIT: {:?}",
            term.reason
        ))),
        other => Err(CoreError::Protocol(format!(
            "expected SessInit, got {}",
            other.kind()
        ))),
    }
}
