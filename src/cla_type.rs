//! Stable numeric tags for the convergence-layer types a node might run
//! (spec.md §4.7). Only `TcpClV4` and `TcpClV4WebSocket` are implemented by
//! this crate; `Mtcp` and `Bbc` are carried as recognised-but-unsupported
//! tags so configuration and logging have a complete, stable taxonomy to
//! refer to even before every CLA is built out.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClaType {
    TcpClV4 = 1,
    TcpClV4WebSocket = 2,
    Mtcp = 3,
    Bbc = 4,
}

impl ClaType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_supported(self) -> bool {
        matches!(self, ClaType::TcpClV4 | ClaType::TcpClV4WebSocket)
    }
}

impl fmt::Display for ClaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClaType::TcpClV4 => "tcpclv4",
            ClaType::TcpClV4WebSocket => "tcpclv4+ws",
            ClaType::Mtcp => "mtcp",
            ClaType::Bbc => "bbc",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_tcp_variants_are_supported() {
        assert!(ClaType::TcpClV4.is_supported());
        assert!(ClaType::TcpClV4WebSocket.is_supported());
        assert!(!ClaType::Mtcp.is_supported());
        assert!(!ClaType::Bbc.is_supported());
    }

    #[test]
    fn numeric_tags_are_stable() {
        assert_eq!(ClaType::TcpClV4.as_u8(), 1);
        assert_eq!(ClaType::TcpClV4WebSocket.as_u8(), 2);
        assert_eq!(ClaType::Mtcp.as_u8(), 3);
        assert_eq!(ClaType::Bbc.as_u8(), 4);
    }
}
