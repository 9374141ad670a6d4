//! Ferry - Protocol
//!
//! Record representation and wire encodings for the metric relay.
//!
//! # Records
//!
//! A record is one metric line with the trailing newline already stripped by
//! the ingress. Inside the transport engine it is an opaque byte string
//! ([`Record`], an alias for `bytes::Bytes` so the redo buffer can retain
//! records without copying). Only the re-encoder interprets it.
//!
//! # Wire formats
//!
//! - **Plaintext**: the record bytes followed by a single `\n`.
//! - **Binary** (when the destination requires re-encoding): the record is
//!   parsed as `name value timestamp` and re-encoded as a length-prefixed
//!   frame, see [`encode`].

mod decode;
mod encode;
mod error;

pub use decode::DataPoint;
pub use encode::{decode_frame, encode_frame};
pub use error::ProtocolError;

/// One metric line, opaque inside the transport engine
pub type Record = bytes::Bytes;

/// Sanitise a `host:port` address for use as a metric-label component
///
/// Dots and colons are replaced with underscores, so the result is safe in
/// dotted metric paths.
///
/// # Example
///
/// ```
/// assert_eq!(ferry_protocol::clean_addr("10.0.0.1:2003"), "10_0_0_1_2003");
/// ```
pub fn clean_addr(addr: &str) -> String {
    addr.replace(['.', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_addr_host_port() {
        assert_eq!(clean_addr("graphite.example.com:2003"), "graphite_example_com_2003");
    }

    #[test]
    fn test_clean_addr_ipv4() {
        assert_eq!(clean_addr("127.0.0.1:2005"), "127_0_0_1_2005");
    }

    #[test]
    fn test_clean_addr_no_separators() {
        assert_eq!(clean_addr("localhost"), "localhost");
    }
}
