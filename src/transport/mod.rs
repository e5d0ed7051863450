//! # Listener / dialer (C7)
//!
//! Transport-establishment helpers for the two CLA types this crate wires
//! up end to end: plain TCPCLv4 and a WebSocket-tunnelled variant of the
//! same framing (spec.md §4.7: "message framing is unchanged"). Both
//! produce a boxed [`ByteStream`] so [`crate::session::Session`] never has
//! to know which transport it's driving.

pub mod tcp;
pub mod websocket;

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that looks like a duplex byte stream to the message switch.
/// Implemented for any `AsyncRead + AsyncWrite + Unpin + Send`, covering
/// both a raw `TcpStream` and the WebSocket adapter.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}
