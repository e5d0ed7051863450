//! # Transfer manager (C5)
//!
//! Bidirectional bundle transfer over the `Message` channels the
//! Established stage exposes. [`TransferManager::send`] chunks a bundle
//! into `XFER_SEGMENT`s and blocks until the peer's acks cover the whole
//! transfer or it is refused; a single background pump reassembles inbound
//! segments, acks them, and hands completed bundles to the host on
//! `bundles_out`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::error::CoreError;
use crate::stage::EstablishedChannels;
use crate::wire::{Message, RefusalReasonCode, SegmentFlags, XferAck, XferRefuse, XferSegment};

/// What the incoming pump reports back to an in-flight `send()` call.
enum AckEvent {
    Ack { length: u64 },
    Refuse(RefusalReasonCode),
    /// The segment-sending half of this transfer failed (the switch died
    /// mid-write); carried as a string since `CoreError` isn't `Clone`.
    SendFailed(String),
}

#[derive(Default)]
struct IncomingTransfer {
    buffer: Vec<u8>,
    ended: bool,
}

/// The receiving half of a transfer manager: fully reassembled bundles and
/// the at-most-one protocol fault the incoming pump can raise. Kept
/// separate from [`TransferManager`] itself so the manager can be shared
/// (via `Arc`) between concurrent `send()` callers while exactly one task
/// — the session supervisor — owns these receivers outright; a manager
/// that bundled `&mut self` receivers alongside a `send(&self)` method
/// could never be both shared and drained from a single owner.
pub struct TransferInbox {
    /// Bundles fully reassembled from the peer, in arrival order.
    pub bundles_out: mpsc::Receiver<Bundle>,
    /// At most one protocol fault from the incoming pump; once this fires
    /// the pump has stopped.
    pub errors: mpsc::Receiver<CoreError>,
}

pub struct TransferManager {
    msg_out: mpsc::Sender<Message>,
    next_id: AtomicU64,
    segment_mtu: u64,
    ack_routes: Arc<Mutex<HashMap<u64, mpsc::Sender<AckEvent>>>>,
    stop_rx: watch::Receiver<bool>,
}

impl TransferManager {
    pub fn new(
        channels: EstablishedChannels,
        segment_mtu: u64,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, TransferInbox) {
        let EstablishedChannels { incoming, outgoing } = channels;
        let (bundles_tx, bundles_out) = mpsc::channel(16);
        let (error_tx, errors) = mpsc::channel(1);
        let ack_routes: Arc<Mutex<HashMap<u64, mpsc::Sender<AckEvent>>>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(incoming_pump(
            incoming,
            outgoing.clone(),
            bundles_tx,
            error_tx,
            ack_routes.clone(),
        ));

        let manager = TransferManager {
            msg_out: outgoing,
            next_id: AtomicU64::new(0),
            segment_mtu: segment_mtu.max(1),
            ack_routes,
            stop_rx,
        };
        (manager, TransferInbox { bundles_out, errors })
    }

    /// Send `bundle`, blocking until the peer has acked the full transfer.
    /// Safe to call concurrently: each call allocates its own monotone
    /// transfer id and ack route.
    pub async fn send(&self, bundle: Bundle) -> Result<(), CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = mpsc::channel(8);
        self.ack_routes.lock().await.insert(id, ack_tx.clone());

        let expected_len = Arc::new(AtomicU64::new(0));
        let finalized = Arc::new(AtomicBool::new(false));

        let msg_out = self.msg_out.clone();
        let data = bundle.into_bytes();
        let segment_mtu = self.segment_mtu as usize;
        let sender_expected_len = expected_len.clone();
        let sender_finalized = finalized.clone();
        tokio::spawn(async move {
            let result = send_segments(msg_out, id, data, segment_mtu, &sender_expected_len).await;
            match result {
                Ok(()) => sender_finalized.store(true, Ordering::SeqCst),
                Err(e) => {
                    let _ = ack_tx.send(AckEvent::SendFailed(e.to_string())).await;
                }
            }
        });

        let result = reconcile_acks(ack_rx, expected_len, finalized, self.stop_rx.clone()).await;
        self.ack_routes.lock().await.remove(&id);
        result
    }
}

async fn send_segments(
    msg_out: mpsc::Sender<Message>,
    transfer_id: u64,
    data: Vec<u8>,
    segment_mtu: usize,
    expected_len: &Arc<AtomicU64>,
) -> Result<(), CoreError> {
    if data.is_empty() {
        let segment = XferSegment {
            flags: SegmentFlags::empty().with_start(true).with_end(true),
            transfer_id,
            data: Vec::new(),
        };
        msg_out
            .send(Message::XferSegment(segment))
            .await
            .map_err(|_| CoreError::StageClose)?;
        return Ok(());
    }

    let mut offset = 0usize;
    let mut index = 0usize;
    while offset < data.len() {
        let end = (offset + segment_mtu).min(data.len());
        let chunk = &data[offset..end];
        let segment = XferSegment {
            flags: SegmentFlags::empty()
                .with_start(index == 0)
                .with_end(end == data.len()),
            transfer_id,
            data: chunk.to_vec(),
        };
        msg_out
            .send(Message::XferSegment(segment))
            .await
            .map_err(|_| CoreError::StageClose)?;
        expected_len.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        offset = end;
        index += 1;
    }
    Ok(())
}

/// Races acks against the negotiated stop signal, rechecking every 100ms so
/// a late-finalised `expected_len` (set by `send_segments` concurrently)
/// still terminates the transfer even if no further ack arrives.
async fn reconcile_acks(
    mut ack_rx: mpsc::Receiver<AckEvent>,
    expected_len: Arc<AtomicU64>,
    finalized: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), CoreError> {
    let mut latest_ack_len: u64 = 0;
    loop {
        let is_complete = |latest: u64| finalized.load(Ordering::SeqCst) && latest >= expected_len.load(Ordering::SeqCst);
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return Err(CoreError::ManagerStopped),
            maybe = ack_rx.recv() => {
                match maybe {
                    Some(AckEvent::Ack { length }) => {
                        latest_ack_len = latest_ack_len.max(length);
                        if is_complete(latest_ack_len) {
                            return Ok(());
                        }
                    }
                    Some(AckEvent::Refuse(reason)) => return Err(CoreError::TransferRefused(reason)),
                    Some(AckEvent::SendFailed(message)) => return Err(CoreError::transient_fatal(message)),
                    None => return Err(CoreError::StageClose),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if is_complete(latest_ack_len) {
                    return Ok(());
                }
            }
        }
    }
}

async fn incoming_pump(
    mut msg_in: mpsc::Receiver<Message>,
    msg_out: mpsc::Sender<Message>,
    bundles_out: mpsc::Sender<Bundle>,
    errors: mpsc::Sender<CoreError>,
    ack_routes: Arc<Mutex<HashMap<u64, mpsc::Sender<AckEvent>>>>,
) {
    let mut incoming_transfers: HashMap<u64, IncomingTransfer> = HashMap::new();
    while let Some(message) = msg_in.recv().await {
        let result = handle_inbound(message, &mut incoming_transfers, &msg_out, &bundles_out, &ack_routes).await;
        if let Err(e) = result {
            warn!(error = %e, "transfer manager stopping on protocol error");
            let _ = errors.send(e).await;
            return;
        }
    }
}

async fn handle_inbound(
    message: Message,
    incoming_transfers: &mut HashMap<u64, IncomingTransfer>,
    msg_out: &mpsc::Sender<Message>,
    bundles_out: &mpsc::Sender<Bundle>,
    ack_routes: &Arc<Mutex<HashMap<u64, mpsc::Sender<AckEvent>>>>,
) -> Result<(), CoreError> {
    match message {
        Message::XferSegment(segment) => handle_segment(segment, incoming_transfers, msg_out, bundles_out).await,
        Message::XferAck(ack) => route_ack(ack_routes, ack.transfer_id, AckEvent::Ack { length: ack.ack_length }).await,
        Message::XferRefuse(refuse) => route_ack(ack_routes, refuse.transfer_id, AckEvent::Refuse(refuse.reason)).await,
        other => Err(CoreError::Protocol(format!(
            "unexpected message reached the transfer manager: {}",
            other.kind()
        ))),
    }
}

async fn handle_segment(
    segment: XferSegment,
    incoming_transfers: &mut HashMap<u64, IncomingTransfer>,
    msg_out: &mpsc::Sender<Message>,
    bundles_out: &mpsc::Sender<Bundle>,
) -> Result<(), CoreError> {
    let transfer_id = segment.transfer_id;
    let transfer = incoming_transfers.entry(transfer_id).or_default();
    if transfer.ended {
        return Err(CoreError::Protocol(format!(
            "duplicate END segment for transfer {transfer_id}"
        )));
    }
    transfer.buffer.extend_from_slice(&segment.data);
    if segment.flags.is_end() {
        transfer.ended = true;
    }

    let ack = XferAck {
        flags: segment.flags,
        transfer_id,
        ack_length: transfer.buffer.len() as u64,
    };
    msg_out
        .send(Message::XferAck(ack))
        .await
        .map_err(|_| CoreError::StageClose)?;

    if transfer.ended {
        let transfer = incoming_transfers.remove(&transfer_id).expect("just inserted above");
        match Bundle::parse(transfer.buffer) {
            Ok(bundle) => {
                debug!(transfer_id, len = bundle.len(), "transfer reassembled");
                bundles_out
                    .send(bundle)
                    .await
                    .map_err(|_| CoreError::StageClose)?;
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "reassembled transfer failed to parse, refusing");
                msg_out
                    .send(Message::XferRefuse(XferRefuse {
                        reason: RefusalReasonCode::Unknown,
                        transfer_id,
                    }))
                    .await
                    .map_err(|_| CoreError::StageClose)?;
            }
        }
    }
    Ok(())
}

async fn route_ack(
    ack_routes: &Arc<Mutex<HashMap<u64, mpsc::Sender<AckEvent>>>>,
    transfer_id: u64,
    event: AckEvent,
) -> Result<(), CoreError> {
    let routes = ack_routes.lock().await;
    match routes.get(&transfer_id) {
        Some(tx) => {
            let _ = tx.send(event).await;
            Ok(())
        }
        None => Err(CoreError::Protocol(format!(
            "ack/refuse for unknown transfer id {transfer_id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_manual_peer(
        segment_mtu: u64,
    ) -> (TransferManager, TransferInbox, mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        let (to_manager_tx, to_manager_rx) = mpsc::channel(64);
        let (from_manager_tx, from_manager_rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let channels = EstablishedChannels {
            incoming: to_manager_rx,
            outgoing: from_manager_tx,
        };
        let (manager, inbox) = TransferManager::new(channels, segment_mtu, stop_rx);
        (manager, inbox, to_manager_tx, from_manager_rx)
    }

    fn wired_pair(segment_mtu: u64) -> ((TransferManager, TransferInbox), (TransferManager, TransferInbox)) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(64);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let a_channels = EstablishedChannels {
            incoming: b_to_a_rx,
            outgoing: a_to_b_tx,
        };
        let b_channels = EstablishedChannels {
            incoming: a_to_b_rx,
            outgoing: b_to_a_tx,
        };
        (
            TransferManager::new(a_channels, segment_mtu, stop_rx.clone()),
            TransferManager::new(b_channels, segment_mtu, stop_rx),
        )
    }

    #[tokio::test]
    async fn send_small_bundle_is_received_whole() {
        let ((a, _a_inbox), (b, mut b_inbox)) = wired_pair(4096);
        a.send(Bundle::from_bytes(b"hello world".to_vec())).await.unwrap();
        let received = b_inbox.bundles_out.recv().await.unwrap();
        assert_eq!(received.as_bytes(), b"hello world");
        drop(b);
    }

    #[tokio::test]
    async fn fragmentation_reassembles_in_order() {
        let ((a, _a_inbox), (b, mut b_inbox)) = wired_pair(4);
        let payload: Vec<u8> = (0u8..40).collect();
        a.send(Bundle::from_bytes(payload.clone())).await.unwrap();
        let received = b_inbox.bundles_out.recv().await.unwrap();
        assert_eq!(received.as_bytes(), payload.as_slice());
        drop(b);
    }

    #[tokio::test]
    async fn concurrent_sends_use_distinct_transfer_ids() {
        let ((a, _a_inbox), (b, mut b_inbox)) = wired_pair(8);
        let first = a.send(Bundle::from_bytes(b"first-payload".to_vec()));
        let second = a.send(Bundle::from_bytes(b"second-payload".to_vec()));
        let (r1, r2) = tokio::join!(first, second);
        r1.unwrap();
        r2.unwrap();

        let mut received = vec![b_inbox.bundles_out.recv().await.unwrap().into_bytes()];
        received.push(b_inbox.bundles_out.recv().await.unwrap().into_bytes());
        received.sort();
        let mut expected = vec![b"first-payload".to_vec(), b"second-payload".to_vec()];
        expected.sort();
        assert_eq!(received, expected);
        drop(b);
    }

    #[tokio::test]
    async fn send_returns_transfer_refused_on_xfer_refuse() {
        let (manager, _inbox, to_manager_tx, mut from_manager_rx) = manager_with_manual_peer(1024);
        let send_fut = manager.send(Bundle::from_bytes(b"abc".to_vec()));

        let sent = from_manager_rx.recv().await.unwrap();
        let transfer_id = match sent {
            Message::XferSegment(s) => s.transfer_id,
            other => panic!("expected XferSegment, got {other:?}"),
        };
        to_manager_tx
            .send(Message::XferRefuse(XferRefuse {
                reason: RefusalReasonCode::NoResources,
                transfer_id,
            }))
            .await
            .unwrap();

        let result = send_fut.await;
        assert!(matches!(
            result,
            Err(CoreError::TransferRefused(RefusalReasonCode::NoResources))
        ));
    }

    #[tokio::test]
    async fn ack_for_unknown_transfer_is_reported_as_protocol_error() {
        let (_manager, mut inbox, to_manager_tx, _from_manager_rx) = manager_with_manual_peer(1024);
        to_manager_tx
            .send(Message::XferAck(XferAck {
                flags: SegmentFlags::empty(),
                transfer_id: 999,
                ack_length: 0,
            }))
            .await
            .unwrap();
        let err = inbox.errors.recv().await.unwrap();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn duplicate_end_segment_is_protocol_error() {
        let (_manager, mut inbox, to_manager_tx, _from_manager_rx) = manager_with_manual_peer(1024);
        let segment = XferSegment {
            flags: SegmentFlags::empty().with_start(true).with_end(true),
            transfer_id: 1,
            data: b"x".to_vec(),
        };
        to_manager_tx.send(Message::XferSegment(segment.clone())).await.unwrap();
        to_manager_tx.send(Message::XferSegment(segment)).await.unwrap();
        let err = inbox.errors.recv().await.unwrap();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn empty_reassembled_transfer_is_refused() {
        let (manager, _inbox, to_manager_tx, mut from_manager_rx) = manager_with_manual_peer(1024);
        let segment = XferSegment {
            flags: SegmentFlags::empty().with_start(true).with_end(true),
            transfer_id: 7,
            data: Vec::new(),
        };
        to_manager_tx.send(Message::XferSegment(segment)).await.unwrap();

        let ack = from_manager_rx.recv().await.unwrap();
        assert!(matches!(ack, Message::XferAck(_)));
        let refuse = from_manager_rx.recv().await.unwrap();
        assert!(matches!(
            refuse,
            Message::XferRefuse(XferRefuse {
                reason: RefusalReasonCode::Unknown,
                transfer_id: 7
            })
        ));
        drop(manager);
    }
}
