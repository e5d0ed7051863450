//! Command-line arguments for the `tcpcl-node` demo binary.
//!
//! This is deliberately narrow: it exercises the Manager/Session/Listener/
//! Dialer surface end to end, not a full DTN node's configuration system
//! (no routing, no EID scheme parsing, no store-and-forward policy — all
//! out of scope per spec.md §1).

use std::time::Duration;

use clap::Parser;

use crate::cla_type::ClaType;
use crate::defaults;
use crate::eid::EndpointId;
use crate::wire::ContactFlags;

/// A minimal TCPCLv4 node: listens for inbound sessions, optionally dials
/// one or more peers, and reports convergence events to the console.
#[derive(Debug, Parser)]
#[command(name = "tcpcl-node", version, about)]
pub struct Args {
    /// Local endpoint id this node identifies itself as during negotiation.
    #[arg(long, default_value = "dtn://local/")]
    pub local_eid: String,

    /// Address to bind and accept inbound sessions on (host:port).
    #[arg(long)]
    pub listen: Option<String>,

    /// Address of a peer to dial on startup (host:port). May be repeated.
    #[arg(long = "dial")]
    pub dial: Vec<String>,

    /// Use the WebSocket-tunnelled carrier instead of plain TCP.
    #[arg(long)]
    pub websocket: bool,

    /// Advertised keepalive interval, in seconds. 0 disables keepalive.
    #[arg(long, default_value_t = defaults::KEEPALIVE_SECS)]
    pub keepalive: u16,

    /// Maximum accepted XFER_SEGMENT payload size, in bytes.
    #[arg(long, default_value_t = defaults::SEGMENT_MRU)]
    pub segment_mru: u64,

    /// Maximum accepted total bundle size, in bytes.
    #[arg(long, default_value_t = defaults::TRANSFER_MRU)]
    pub transfer_mru: u64,

    /// Treat dialed peers as permanent: the Manager never gives up their
    /// retry budget even after it's exhausted.
    #[arg(long)]
    pub permanent: bool,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn cla_type(&self) -> ClaType {
        if self.websocket {
            ClaType::TcpClV4WebSocket
        } else {
            ClaType::TcpClV4
        }
    }

    pub fn local_endpoint_id(&self) -> EndpointId {
        EndpointId::new(self.local_eid.clone())
    }

    pub fn retry_interval(&self) -> Duration {
        defaults::RETRY_INTERVAL
    }

    pub fn contact_flags(&self) -> ContactFlags {
        ContactFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_minimal_listener_invocation() {
        let args = Args::parse_from(["tcpcl-node", "--listen", "0.0.0.0:4556"]);
        assert_eq!(args.listen.as_deref(), Some("0.0.0.0:4556"));
        assert!(args.dial.is_empty());
        assert_eq!(args.keepalive, defaults::KEEPALIVE_SECS);
        assert_eq!(args.cla_type(), ClaType::TcpClV4);
    }

    #[test]
    fn parses_repeated_dial_targets() {
        let args = Args::parse_from([
            "tcpcl-node",
            "--dial",
            "127.0.0.1:4556",
            "--dial",
            "127.0.0.1:4557",
        ]);
        assert_eq!(args.dial, vec!["127.0.0.1:4556", "127.0.0.1:4557"]);
    }

    #[test]
    fn websocket_flag_selects_the_websocket_cla_type() {
        let args = Args::parse_from(["tcpcl-node", "--websocket"]);
        assert_eq!(args.cla_type(), ClaType::TcpClV4WebSocket);
    }
}
