//! # CLA Manager (C8)
//!
//! Supervises many concurrent [`Session`]s under one registry keyed by
//! [`Session::address`]: it periodically attempts `start()` on every
//! inactive element, retries transient failures against a per-element ttl
//! budget, fans every active session's event stream into one aggregate
//! channel the host reads, and restarts a session whenever it reports
//! `PeerDisappeared`. Grounded in the same registry-plus-supervisor shape
//! as the teacher's `HostCoordinator` (`src/coordination.rs`): a
//! `HashMap` of tracked units behind a lock, a background task that walks
//! it on a tick, and a single aggregated result/event path back to the
//! caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::eid::EndpointId;
use crate::session::{ConvergenceStatus, Session, SessionParams};
use crate::transport::tcp;

/// Default remaining-retry budget a freshly registered element starts
/// with (spec.md §4.8).
pub const DEFAULT_INITIAL_TTL: i32 = 10;
/// Default interval between supervisor sweeps (spec.md §4.8).
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

struct Entry {
    session: Arc<Session>,
    ttl: i32,
    active: bool,
    forwarder_stop: Option<oneshot::Sender<()>>,
}

/// A snapshot of one currently-active sending element.
#[derive(Debug, Clone)]
pub struct SenderInfo {
    pub address: String,
    pub peer_eid: EndpointId,
}

/// A snapshot of one currently-active receiving element.
#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    pub address: String,
    pub local_eid: EndpointId,
}

/// Registry, retry supervisor, and fan-in event bus for many [`Session`]s.
pub struct Manager {
    entries: RwLock<HashMap<String, Entry>>,
    events_tx: StdMutex<Option<mpsc::Sender<ConvergenceStatus>>>,
    events_rx: StdMutex<Option<mpsc::Receiver<ConvergenceStatus>>>,
    initial_ttl: i32,
    retry_interval: Duration,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Construct a manager and start its supervisor task immediately.
    pub fn new(initial_ttl: i32, retry_interval: Duration) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (close_tx, close_rx) = watch::channel(false);
        let manager = Arc::new(Manager {
            entries: RwLock::new(HashMap::new()),
            events_tx: StdMutex::new(Some(events_tx)),
            events_rx: StdMutex::new(Some(events_rx)),
            initial_ttl,
            retry_interval,
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
            supervisor: StdMutex::new(None),
        });

        let supervisee = manager.clone();
        let handle = tokio::spawn(async move { supervisee.supervise_loop().await });
        *manager.supervisor.lock().expect("supervisor mutex poisoned") = Some(handle);
        manager
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_INITIAL_TTL, DEFAULT_RETRY_INTERVAL)
    }

    /// Track `session`. Fails if `session.address()` already names an
    /// active element, or if `session.peer_eid()` would collide with the
    /// `local_eid` of an already-active element (self-loop suppression,
    /// spec.md §4.8).
    pub async fn register(&self, session: Arc<Session>) -> Result<(), CoreError> {
        let address = session.address().to_string();
        let peer_eid = session.peer_eid();
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(&address) {
            if existing.active {
                return Err(CoreError::RegistrationRejected(format!(
                    "address {address} already has an active convergence element"
                )));
            }
        }

        if !peer_eid.is_none() {
            for entry in entries.values() {
                if entry.active && *entry.session.local_eid() == peer_eid {
                    return Err(CoreError::RegistrationRejected(format!(
                        "registering {address} would create a self-loop: peer {peer_eid} is this node's own active local eid"
                    )));
                }
            }
        }

        debug!(address = %address, "registering convergence element");
        entries.insert(
            address,
            Entry {
                session,
                ttl: self.initial_ttl,
                active: false,
                forwarder_stop: None,
            },
        );
        Ok(())
    }

    /// Remove and return the tracked session, stopping its event forwarder
    /// if one is running. Does not close the session itself.
    pub async fn unregister(&self, address: &str) -> Result<Arc<Session>, CoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.remove(address).ok_or_else(|| {
            CoreError::RegistrationRejected(format!("no registered element at {address}"))
        })?;
        if let Some(stop) = entry.forwarder_stop {
            let _ = stop.send(());
        }
        Ok(entry.session)
    }

    /// Unregister then re-register the same session, resetting its retry
    /// budget for a fresh attempt cycle (spec.md §4.8: how the Manager
    /// reacts to `PeerDisappeared`).
    pub async fn restart(&self, address: &str) -> Result<(), CoreError> {
        let session = self.unregister(address).await?;
        self.register(session).await
    }

    pub async fn sender_snapshot(&self) -> Vec<SenderInfo> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.active)
            .map(|e| SenderInfo {
                address: e.session.address().to_string(),
                peer_eid: e.session.peer_eid(),
            })
            .collect()
    }

    pub async fn receiver_snapshot(&self) -> Vec<ReceiverInfo> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.active)
            .map(|e| ReceiverInfo {
                address: e.session.address().to_string(),
                local_eid: e.session.local_eid().clone(),
            })
            .collect()
    }

    /// Takes the aggregate event receiver. Returns `None` if already taken.
    pub fn channel(&self) -> Option<mpsc::Receiver<ConvergenceStatus>> {
        self.events_rx.lock().expect("events_rx mutex poisoned").take()
    }

    /// Accept connections on `listener`, wrap each into a passive
    /// [`Session`] using `params`, and register it. Runs until the
    /// manager is closed (spec.md §4.7: Listener registers accepted
    /// connections with the Manager).
    pub fn spawn_tcp_listener(self: &Arc<Self>, listener: tcp::Listener, params: SessionParams) {
        let (accepted_tx, mut accepted_rx) = mpsc::channel(16);
        let stop_rx = self.close_rx.clone();
        tokio::spawn(listener.run(stop_rx, accepted_tx));

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some((stream, remote_addr)) = accepted_rx.recv().await {
                let session = Arc::new(Session::new_passive(
                    Box::new(stream),
                    remote_addr.clone(),
                    params.clone(),
                ));
                if let Err(e) = manager.register(session).await {
                    warn!(error = %e, remote = %remote_addr, "failed to register accepted connection");
                }
            }
        });
    }

    /// Idempotent. Tears down every tracked element, stops the supervisor,
    /// then closes the aggregate event channel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.send(true);

        let drained: Vec<Entry> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            if let Some(stop) = entry.forwarder_stop {
                let _ = stop.send(());
            }
            entry.session.close().await;
        }

        *self.events_tx.lock().expect("events_tx mutex poisoned") = None;
        if let Some(handle) = self
            .supervisor
            .lock()
            .expect("supervisor mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }

    async fn supervise_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut close_rx = self.close_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = close_rx.changed() => return,
                _ = ticker.tick() => self.clone().tick_once().await,
            }
        }
    }

    /// Attempt `start()` on every currently inactive element. Exposed so
    /// a host (or a test) can force an immediate sweep instead of waiting
    /// out `retry_interval`.
    pub async fn tick_once(self: &Arc<Self>) {
        let candidates: Vec<(String, Arc<Session>)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| !e.active)
                .map(|(addr, e)| (addr.clone(), e.session.clone()))
                .collect()
        };

        for (address, session) in candidates {
            match session.start().await {
                Ok(()) => self.mark_active(&address).await,
                Err(e) => self.handle_start_failure(&address, e).await,
            }
        }
    }

    async fn mark_active(self: &Arc<Self>, address: &str) {
        let (session, channel, stop_rx) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(address) else {
                return;
            };
            entry.active = true;
            entry.ttl = -1;
            let session = entry.session.clone();
            let channel = session.channel().await;
            let (stop_tx, stop_rx) = oneshot::channel();
            entry.forwarder_stop = Some(stop_tx);
            (session, channel, stop_rx)
        };

        info!(address, "convergence element active");
        let events_tx = self.events_tx.lock().expect("events_tx mutex poisoned").clone();
        let Some(events_tx) = events_tx else {
            drop(session);
            return;
        };
        let manager = self.clone();
        let address = address.to_string();
        tokio::spawn(forward_events(manager, address, session, channel, events_tx, stop_rx));
    }

    async fn handle_start_failure(&self, address: &str, err: CoreError) {
        if err.is_voluntary() {
            return;
        }
        let retry = err.is_retryable();
        warn!(address, error = %err, retry, "convergence element start failed");

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(address) else {
            return;
        };
        let permanent = entry.session.is_permanent();

        if retry {
            entry.ttl -= 1;
            if entry.ttl < 0 && !permanent {
                debug!(address, "retry budget exhausted, removing element");
                entries.remove(address);
            }
        } else if !permanent {
            debug!(address, "non-retryable start failure, removing element");
            entries.remove(address);
        }
    }
}

/// Drains one active session's event stream into the manager's aggregate
/// channel until the session reports `PeerDisappeared` (at which point the
/// manager restarts it, spec.md §4.8), the session's channel ends, or
/// `stop_rx` fires (the manager closing, or this element being
/// unregistered out from under the forwarder).
async fn forward_events(
    manager: Arc<Manager>,
    address: String,
    _session: Arc<Session>,
    channel: Option<mpsc::Receiver<ConvergenceStatus>>,
    events_tx: mpsc::Sender<ConvergenceStatus>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let Some(mut rx) = channel else { return };
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => return,
            maybe = rx.recv() => {
                let Some(status) = maybe else { return };
                let disappeared = matches!(status, ConvergenceStatus::PeerDisappeared { .. });
                if events_tx.send(status).await.is_err() {
                    return;
                }
                if disappeared {
                    debug!(address, "peer disappeared, restarting element");
                    if let Err(e) = manager.restart(&address).await {
                        debug!(address, error = %e, "restart skipped (already unregistered)");
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cla_type::ClaType;
    use crate::wire::ContactFlags;

    fn params(eid: &str) -> SessionParams {
        SessionParams {
            cla_type: ClaType::TcpClV4,
            local_eid: EndpointId::new(eid),
            keepalive: 30,
            segment_mru: 4096,
            transfer_mru: 1 << 20,
            contact_flags: ContactFlags::empty(),
        }
    }

    #[tokio::test]
    async fn register_then_unregister_round_trips() {
        let manager = Manager::with_defaults();
        let session = Arc::new(Session::new_active("127.0.0.1:1", params("dtn://a/"), false));
        let address = session.address().to_string();
        manager.register(session).await.unwrap();

        let fetched = manager.unregister(&address).await.unwrap();
        assert_eq!(fetched.address(), address);
        manager.close().await;
    }

    #[tokio::test]
    async fn unregister_unknown_address_is_rejected() {
        let manager = Manager::with_defaults();
        let err = manager.unregister("nowhere").await.unwrap_err();
        assert!(matches!(err, CoreError::RegistrationRejected(_)));
        manager.close().await;
    }

    #[tokio::test]
    async fn re_registering_an_inactive_address_overwrites() {
        let manager = Manager::with_defaults();
        let s1 = Arc::new(Session::new_active("127.0.0.1:1", params("dtn://a/"), false));
        let s2 = Arc::new(Session::new_active("127.0.0.1:1", params("dtn://a/"), false));
        manager.register(s1).await.unwrap();
        manager.register(s2).await.unwrap();
        manager.close().await;
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_after_initial_ttl_plus_one_attempts() {
        // initial ttl = 3 means: the first attempt plus three retries (four
        // attempts total) before the element is removed (spec.md §8
        // scenario 5).
        let manager = Manager::new(3, Duration::from_millis(20));
        let session = Arc::new(Session::new_active("127.0.0.1:1", params("dtn://a/"), false));
        let address = session.address().to_string();
        manager.register(session).await.unwrap();

        for _ in 0..3 {
            manager.tick_once().await;
            assert!(
                manager.entries.read().await.contains_key(&address),
                "element should still be present for this attempt"
            );
        }
        manager.tick_once().await;
        assert!(
            !manager.entries.read().await.contains_key(&address),
            "element should be removed after the fourth failed attempt"
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn permanent_element_survives_exhausted_retry_budget() {
        let manager = Manager::new(1, Duration::from_millis(20));
        let session = Arc::new(Session::new_active("127.0.0.1:1", params("dtn://a/"), true));
        let address = session.address().to_string();
        manager.register(session).await.unwrap();

        for _ in 0..10 {
            manager.tick_once().await;
        }
        assert!(
            manager.entries.read().await.contains_key(&address),
            "a permanent element must never be removed by the retry budget"
        );
        manager.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = Manager::with_defaults();
        manager.close().await;
        manager.close().await;
    }
}
