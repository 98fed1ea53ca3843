//! Tunnels TCP and UDP traffic through ICMP echo packets.
//!
//! A [endpoint::client::Client] accepts local application traffic and sends it as echo requests
//!  to a [endpoint::server::Server], which relays it to the target the client names and sends
//!  the target's responses back as echo replies. Every packet carries a single [envelope::Envelope].
//!  In TCP mode, the envelopes' payloads are frames of a reliable stream protocol, see the
//!  `pingtunnel-transport` crate.

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod icmp;
pub mod stats;
pub mod test_util;
pub mod util;
