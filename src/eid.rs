//! Minimal stand-in for the DTN endpoint-identifier type.
//!
//! The real EID parser (`dtn://...`, `ipn:node.svc`, the distinguished
//! "none" endpoint) is out of scope here (spec.md §1) — the CLA never
//! parses or validates an EID, it only compares, stores, and serialises it
//! as length-prefixed UTF-8. [`EndpointId`] provides exactly that surface
//! so the rest of the crate has a concrete type to compile and test
//! against; a host node would normally inject its own richer type through
//! the same seam.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// An opaque DTN endpoint identifier, stored as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(String);

impl EndpointId {
    /// The distinguished "none" endpoint, used before negotiation has
    /// produced a peer identity.
    pub fn none() -> Self {
        EndpointId("dtn:none".to_string())
    }

    pub fn new(s: impl Into<String>) -> Self {
        EndpointId(s.into())
    }

    pub fn is_none(&self) -> bool {
        self.0 == "dtn:none"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Serialise as a u16-length-prefixed UTF-8 string, as used by
    /// SESS_INIT's node-id field.
    pub async fn write_u16_prefixed<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
    ) -> Result<(), CoreError> {
        let bytes = self.0.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(CoreError::Negotiation(
                "node id too long to encode in a u16-prefixed field".into(),
            ));
        }
        w.write_u16(bytes.len() as u16).await?;
        w.write_all(bytes).await?;
        Ok(())
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub async fn read_u16_prefixed<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let len = r.read_u16().await?;
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).await?;
        let s = String::from_utf8(buf).map_err(|e| CoreError::Decode(e.to_string()))?;
        Ok(EndpointId(s))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        EndpointId(s)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_string())
    }
}
