//! WebSocket-tunnelled TCPCLv4 (spec.md §4.7: "message framing is
//! unchanged" — only the byte-stream carrier differs). [`WsByteStream`]
//! adapts a `WebSocketStream` into `AsyncRead + AsyncWrite` so the rest of
//! the crate (C1-C6) never has to know it isn't talking to a raw TCP
//! socket: each flushed write becomes exactly one binary WebSocket frame,
//! mirroring the "flush atomically per message" contract the message
//! switch already relies on for plain TCP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::CoreError;

pub async fn connect(addr: &str) -> Result<WsByteStream<TcpStream>, CoreError> {
    let tcp = super::tcp::connect(addr, 256 * 1024).await?;
    let request = format!("ws://{addr}/tcpcl")
        .into_client_request()
        .map_err(ws_err)?;
    let (ws, _response) = tokio_tungstenite::client_async(request, tcp)
        .await
        .map_err(ws_err)?;
    Ok(WsByteStream::new(ws))
}

pub async fn accept(tcp: TcpStream) -> Result<WsByteStream<TcpStream>, CoreError> {
    let ws = tokio_tungstenite::accept_async(tcp).await.map_err(ws_err)?;
    Ok(WsByteStream::new(ws))
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> CoreError {
    CoreError::transient(format!("websocket handshake failed: {e}"))
}

fn io_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Adapts a `WebSocketStream` to `AsyncRead`/`AsyncWrite`. Writes are
/// buffered until `poll_flush`, at which point the accumulated bytes go
/// out as a single binary frame; reads drain binary frames into an
/// internal buffer and ignore control frames transparently.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
}

impl<S> WsByteStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        WsByteStream {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            write_buf: Vec::new(),
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let available = &this.read_buf[this.read_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(WsMessage::Binary(data)))) => {
                    this.read_buf = data;
                    this.read_pos = 0;
                    if this.read_buf.is_empty() {
                        continue;
                    }
                }
                Poll::Ready(Some(Ok(WsMessage::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(())); // EOF
                }
                Poll::Ready(Some(Ok(_control_or_text))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io_err(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write_buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io_err(e))),
            Poll::Pending => return Poll::Pending,
        }
        if !this.write_buf.is_empty() {
            let data = std::mem::take(&mut this.write_buf);
            if let Err(e) = Pin::new(&mut this.inner).start_send(WsMessage::Binary(data)) {
                return Poll::Ready(Err(io_err(e)));
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx).map_err(io_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_close(cx).map_err(io_err)
    }
}
