//! # Session / Client (C6)
//!
//! Binds one transport to the C2 -> C3 -> C5 pipeline and presents the
//! external CLA interface: [`Session::start`], [`Session::send`],
//! [`Session::close`], and the identity/event getters the Manager (C8)
//! needs to supervise many of these at once.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bundle::Bundle;
use crate::cla_type::ClaType;
use crate::eid::EndpointId;
use crate::error::CoreError;
use crate::stage::{
    Configuration, ContactStage, Role, SessEstablishedStage, SessInitStage, Stage, StageHandler,
    State,
};
use crate::switch::MessageSwitch;
use crate::transfer::{TransferInbox, TransferManager};
use crate::transport::{tcp, websocket, ByteStream};
use crate::wire::{ContactFlags, Message, SessTerm, SessTermFlags, SessTermReasonCode};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Events a session (and, aggregated, the Manager) publishes to the host.
#[derive(Debug, Clone)]
pub enum ConvergenceStatus {
    PeerAppeared { address: String, peer_eid: EndpointId },
    PeerDisappeared { address: String },
    ReceivedBundle { address: String, bundle: Bundle },
}

/// This node's advertised parameters for any session it establishes,
/// independent of which side dials.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub cla_type: ClaType,
    pub local_eid: EndpointId,
    pub keepalive: u16,
    pub segment_mru: u64,
    pub transfer_mru: u64,
    pub contact_flags: ContactFlags,
}

enum Mode {
    /// Dials `remote_addr` on `start`. May be retried (unless `permanent`
    /// governs the Manager's ttl policy instead).
    Active { remote_addr: String },
    /// Wraps an already-accepted transport. `start` may run exactly once;
    /// the stream is consumed on the first call.
    Passive { stream: Mutex<Option<Box<dyn ByteStream>>> },
}

pub struct Session {
    address: String,
    params: SessionParams,
    mode: Mode,
    permanent: bool,
    peer_eid: StdMutex<EndpointId>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    events_tx: mpsc::Sender<ConvergenceStatus>,
    events_rx: Mutex<Option<mpsc::Receiver<ConvergenceStatus>>>,
    transfer: Mutex<Option<Arc<TransferManager>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    pub fn new_active(remote_addr: impl Into<String>, params: SessionParams, permanent: bool) -> Self {
        let remote_addr = remote_addr.into();
        let address = format!("{}://{}", params.cla_type, remote_addr);
        Session::build(address, Mode::Active { remote_addr }, params, permanent)
    }

    /// `stream` is typically handed over by a [`crate::transport::tcp::Listener`]
    /// (already WebSocket-upgraded by the caller if `params.cla_type` calls
    /// for it). Passive sessions are never permanent: there is no address
    /// to redial.
    pub fn new_passive(
        stream: Box<dyn ByteStream>,
        remote_addr: impl Into<String>,
        params: SessionParams,
    ) -> Self {
        let address = format!("{}://{}", params.cla_type, remote_addr.into());
        Session::build(
            address,
            Mode::Passive {
                stream: Mutex::new(Some(stream)),
            },
            params,
            false,
        )
    }

    fn build(address: String, mode: Mode, params: SessionParams, permanent: bool) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(32);
        Session {
            address,
            peer_eid: StdMutex::new(EndpointId::none()),
            params,
            mode,
            permanent,
            close_tx,
            close_rx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            transfer: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn local_eid(&self) -> &EndpointId {
        &self.params.local_eid
    }

    pub fn peer_eid(&self) -> EndpointId {
        self.peer_eid.lock().expect("peer_eid mutex poisoned").clone()
    }

    /// Takes the session's event receiver. Returns `None` if already taken
    /// (each session's channel has exactly one consumer — typically the
    /// Manager's per-element forwarder task).
    pub async fn channel(&self) -> Option<mpsc::Receiver<ConvergenceStatus>> {
        self.events_rx.lock().await.take()
    }

    pub async fn send(&self, bundle: Bundle) -> Result<(), CoreError> {
        let transfer = self
            .transfer
            .lock()
            .await
            .clone()
            .ok_or(CoreError::ManagerStopped)?;
        transfer.send(bundle).await
    }

    /// Dial (active) or wrap (passive) the transport, run the handshake to
    /// Established, then hand off to a supervising task. Returns once
    /// Established or the 15s handshake timeout fires.
    pub async fn start(&self) -> Result<(), CoreError> {
        let stream = self.acquire_transport().await?;
        let (reader, writer) = tokio::io::split(stream);
        let mut switch = MessageSwitch::new(reader, writer);

        let role = match &self.mode {
            Mode::Active { .. } => Role::Active,
            Mode::Passive { .. } => Role::Passive,
        };
        let config = Configuration {
            role,
            contact_flags: self.params.contact_flags,
            keepalive: self.params.keepalive,
            segment_mru: self.params.segment_mru,
            transfer_mru: self.params.transfer_mru,
            local_node_id: self.params.local_eid.clone(),
        };
        let mut state = State::new(config, self.close_rx.clone());

        match timeout(HANDSHAKE_TIMEOUT, run_handshake(self.close_tx.clone(), &mut switch, &mut state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if matches!(e, CoreError::Negotiation(_)) {
                    let _ = switch
                        .outgoing
                        .send(Message::SessTerm(SessTerm {
                            flags: SessTermFlags::empty(),
                            reason: SessTermReasonCode::VersionMismatch,
                        }))
                        .await;
                }
                let _ = switch.close();
                return Err(e);
            }
            Err(_) => {
                let _ = switch.close();
                return Err(CoreError::Timeout);
            }
        }

        let negotiated = state.negotiated.clone().expect("handshake succeeded without negotiated state");
        *self.peer_eid.lock().expect("peer_eid mutex poisoned") = negotiated.peer_node_id.clone();

        let (established_stage, channels) = SessEstablishedStage::new(negotiated.clone());
        let (transfer, inbox) = TransferManager::new(channels, negotiated.segment_mtu, self.close_rx.clone());
        *self.transfer.lock().await = Some(Arc::new(transfer));

        let address = self.address.clone();
        let peer_eid = negotiated.peer_node_id.clone();
        let events_tx = self.events_tx.clone();

        let handle = tokio::spawn(supervise(
            switch,
            state,
            established_stage,
            inbox,
            address,
            peer_eid,
            events_tx,
        ));
        *self.supervisor.lock().await = Some(handle);

        info!(address = %self.address, "session established");
        Ok(())
    }

    async fn acquire_transport(&self) -> Result<Box<dyn ByteStream>, CoreError> {
        match &self.mode {
            Mode::Active { remote_addr } => dial(remote_addr, self.params.cla_type).await,
            Mode::Passive { stream } => stream
                .lock()
                .await
                .take()
                .ok_or_else(|| CoreError::transient_fatal("passive session already started once")),
        }
    }

    /// Idempotent. Signals every in-flight stage to close and waits for
    /// the supervising task (if any) to finish tearing down C5/C3/C2.
    pub async fn close(&self) {
        let _ = self.close_tx.send(true);
        *self.transfer.lock().await = None;
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn dial(remote_addr: &str, cla_type: ClaType) -> Result<Box<dyn ByteStream>, CoreError> {
    match cla_type {
        ClaType::TcpClV4 => Ok(Box::new(tcp::connect(remote_addr, TCP_BUFFER_SIZE).await?)),
        ClaType::TcpClV4WebSocket => Ok(Box::new(websocket::connect(remote_addr).await?)),
        other => Err(CoreError::transient_fatal(format!(
            "cla type {other} has no transport implementation"
        ))),
    }
}

async fn run_handshake(
    close_tx: watch::Sender<bool>,
    switch: &mut MessageSwitch,
    state: &mut State,
) -> Result<(), CoreError> {
    let mut handler = StageHandler::new(close_tx);
    handler.push(Box::new(ContactStage::new()) as Box<dyn Stage>);
    handler.push(Box::new(SessInitStage::new()) as Box<dyn Stage>);
    handler.run(switch, state).await
}

/// Runs for the life of an established session: the Established stage's
/// steady-state pump plus forwarding of transfer-manager events to the
/// host, until either ends the session.
async fn supervise(
    mut switch: MessageSwitch,
    mut state: State,
    mut established_stage: SessEstablishedStage,
    mut transfer: TransferInbox,
    address: String,
    peer_eid: EndpointId,
    events_tx: mpsc::Sender<ConvergenceStatus>,
) {
    let _ = events_tx
        .send(ConvergenceStatus::PeerAppeared {
            address: address.clone(),
            peer_eid,
        })
        .await;

    let established_fut = established_stage.start(&mut switch, &mut state);
    tokio::pin!(established_fut);

    let mut voluntary_close = false;
    loop {
        tokio::select! {
            biased;
            result = &mut established_fut => {
                if let Err(e) = result {
                    voluntary_close = e.is_voluntary();
                    if !voluntary_close {
                        warn!(error = %e, address = %address, "session ended");
                    }
                }
                break;
            }
            bundle = transfer.bundles_out.recv() => {
                let Some(bundle) = bundle else { break; };
                let _ = events_tx.send(ConvergenceStatus::ReceivedBundle {
                    address: address.clone(),
                    bundle,
                }).await;
            }
            error = transfer.errors.recv() => {
                if let Some(e) = error {
                    warn!(error = %e, address = %address, "transfer manager failed");
                }
                break;
            }
        }
    }

    if voluntary_close {
        let _ = switch
            .outgoing
            .send(Message::SessTerm(SessTerm {
                flags: SessTermFlags::empty(),
                reason: SessTermReasonCode::Unknown,
            }))
            .await;
    }
    let _ = switch.close();
    let _ = events_tx
        .send(ConvergenceStatus::PeerDisappeared { address })
        .await;
}
