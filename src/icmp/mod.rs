//! ICMP echo packets: the carrier for all tunnel traffic.

pub mod checksum;
pub mod echo;
