//! # Message switch (C2)
//!
//! Separates transport I/O from protocol logic. [`MessageSwitch::new`]
//! spawns one reader task (blocking on [`crate::wire::read_message`]) and
//! one writer task (blocking on an outgoing channel, then serialising and
//! flushing) over a split byte-stream pair. Callers only ever see typed
//! [`Message`]s on `incoming` and push typed `Message`s onto `outgoing`;
//! at most one error is ever emitted on `errors`, after which the switch
//! is finished and both tasks have stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::wire::{self, Message};

/// Handle to a running message switch. Dropping this does not stop the
/// tasks; call [`MessageSwitch::close`] for an orderly shutdown.
pub struct MessageSwitch {
    pub incoming: mpsc::Receiver<Message>,
    pub outgoing: mpsc::Sender<Message>,
    pub errors: mpsc::Receiver<CoreError>,
    finished: Arc<AtomicBool>,
    reader_close: Option<oneshot::Sender<()>>,
    writer_close: Option<oneshot::Sender<()>>,
}

impl MessageSwitch {
    /// Spawn the reader and writer tasks over `reader`/`writer`, which are
    /// typically the two halves of a split `TcpStream` (or, in tests, a
    /// `tokio::io::duplex` pair).
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::channel(32);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
        let (error_tx, error_rx) = mpsc::channel(1);
        let finished = Arc::new(AtomicBool::new(false));

        let (reader_close_tx, reader_close_rx) = oneshot::channel();
        let (writer_close_tx, writer_close_rx) = oneshot::channel();

        tokio::spawn(reader_task(
            reader,
            incoming_tx,
            error_tx.clone(),
            finished.clone(),
            reader_close_rx,
        ));
        tokio::spawn(writer_task(
            writer,
            outgoing_rx,
            error_tx,
            finished.clone(),
            writer_close_rx,
        ));

        MessageSwitch {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
            errors: error_rx,
            finished,
            reader_close: Some(reader_close_tx),
            writer_close: Some(writer_close_tx),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Force the switch to `Finished`. Idempotent; returns an error iff
    /// the switch was already finished when called.
    pub fn close(&mut self) -> Result<(), CoreError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(CoreError::StageClose);
        }
        if let Some(tx) = self.reader_close.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.writer_close.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

async fn reader_task<R>(
    reader: R,
    incoming: mpsc::Sender<Message>,
    errors: mpsc::Sender<CoreError>,
    finished: Arc<AtomicBool>,
    mut close: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffered = BufReader::new(reader);
    loop {
        tokio::select! {
            biased;
            _ = &mut close => {
                debug!("message switch reader closing on request");
                return;
            }
            result = wire::read_message(&mut buffered) => {
                match result {
                    Ok(message) => {
                        debug!(kind = message.kind(), "read message");
                        if incoming.send(message).await.is_err() {
                            debug!("message switch incoming receiver dropped");
                            return;
                        }
                    }
                    Err(e) => {
                        if !finished.swap(true, Ordering::SeqCst) {
                            warn!(error = %e, "message switch reader failed");
                            let _ = errors.send(e).await;
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn writer_task<W>(
    writer: W,
    mut outgoing: mpsc::Receiver<Message>,
    errors: mpsc::Sender<CoreError>,
    finished: Arc<AtomicBool>,
    mut close: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buffered = BufWriter::new(writer);
    loop {
        tokio::select! {
            biased;
            _ = &mut close => {
                // Drain whatever was already queued (e.g. a best-effort
                // SESS_TERM sent in the same breath as close()) before
                // tearing down, so a caller's "send then close" isn't lost
                // to the race between this branch and `outgoing.recv()`.
                while let Ok(message) = outgoing.try_recv() {
                    let kind = message.kind();
                    if message.marshal(&mut buffered).await.is_err() {
                        break;
                    }
                    debug!(kind, "wrote message during close drain");
                }
                debug!("message switch writer closing on request");
                let _ = buffered.flush().await;
                return;
            }
            maybe_message = outgoing.recv() => {
                let Some(message) = maybe_message else {
                    debug!("message switch outgoing sender dropped");
                    return;
                };
                let result: Result<(), CoreError> = async {
                    message.marshal(&mut buffered).await?;
                    buffered.flush().await?;
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    if !finished.swap(true, Ordering::SeqCst) {
                        warn!(error = %e, "message switch writer failed");
                        let _ = errors.send(e).await;
                    }
                    return;
                }
                debug!(kind = message.kind(), "wrote message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ContactFlags, ContactHeader};

    #[tokio::test]
    async fn pumps_messages_both_directions() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let mut client_switch = MessageSwitch::new(client_r, client_w);
        let mut server_switch = MessageSwitch::new(server_r, server_w);

        client_switch
            .outgoing
            .send(Message::ContactHeader(ContactHeader::new(
                ContactFlags::empty(),
            )))
            .await
            .unwrap();

        let received = server_switch.incoming.recv().await.unwrap();
        assert_eq!(
            received,
            Message::ContactHeader(ContactHeader::new(ContactFlags::empty()))
        );

        server_switch
            .outgoing
            .send(Message::Keepalive(crate::wire::Keepalive))
            .await
            .unwrap();
        let received = client_switch.incoming.recv().await.unwrap();
        assert_eq!(received, Message::Keepalive(crate::wire::Keepalive));
    }

    #[tokio::test]
    async fn emits_error_once_on_malformed_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (server_r, server_w) = tokio::io::split(server);
        let mut server_switch = MessageSwitch::new(server_r, server_w);

        client.write_all(&[0xab]).await.unwrap();
        let err = server_switch.errors.recv().await.unwrap();
        assert!(matches!(err, CoreError::UnknownMessageType(0xab)));
        assert!(server_switch.is_finished());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reports_already_finished() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let (client_r, client_w) = tokio::io::split(client);
        let mut sw = MessageSwitch::new(client_r, client_w);
        sw.close().unwrap();
        assert!(sw.close().is_err());
    }
}
