//! # TCPCLv4 Convergence Layer Adapter
//!
//! A convergence layer adapter (CLA) for Delay-Tolerant Networking, built
//! around the TCPCLv4 session protocol: a binary, length-prefixed wire
//! codec, a four-stage session handshake, segmented bundle transfer with
//! ack/refuse reconciliation, and a manager that supervises many concurrent
//! sessions with retry budgets and self-loop suppression.
//!
//! The modules mirror the protocol's own layering:
//!
//! - [`wire`] — message encoding/decoding (C1)
//! - [`switch`] — the reader/writer message pump over one byte stream (C2)
//! - [`stage`] — the Contact / SessInit / Established state machine (C3)
//! - [`keepalive`] — the re-armable keepalive ticker (C4)
//! - [`transfer`] — segmented transfer send/receive and reconciliation (C5)
//! - [`session`] — binds the above into one session/client (C6)
//! - [`transport`] — TCP and WebSocket byte-stream establishment (C7)
//! - [`manager`] — the registry and supervisor over many sessions (C8)

pub mod bundle;
pub mod cla_type;
pub mod cli;
pub mod eid;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod manager;
pub mod session;
pub mod stage;
pub mod switch;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use bundle::Bundle;
pub use cla_type::ClaType;
pub use eid::EndpointId;
pub use error::CoreError;
pub use manager::Manager;
pub use session::{ConvergenceStatus, Session, SessionParams};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values (spec.md §3, §4.7).
pub mod defaults {
    use std::time::Duration;

    /// Default advertised keepalive interval, in seconds.
    pub const KEEPALIVE_SECS: u16 = 30;

    /// Default segment MRU (maximum bundle fragment accepted per XFER_SEGMENT).
    pub const SEGMENT_MRU: u64 = 64 * 1024;

    /// Default transfer MRU (maximum total bundle size accepted).
    pub const TRANSFER_MRU: u64 = 16 * 1024 * 1024;

    /// Default stage (handshake) timeout.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default initial retry budget for a freshly registered Manager element.
    pub const INITIAL_TTL: i32 = 10;

    /// Default interval between Manager supervisor sweeps.
    pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);
}
