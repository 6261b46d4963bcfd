//! Reference transport drivers.
//!
//! Working implementations of the [`transport`](crate::transport) contract,
//! selected by the binary: [`tcp::NativeTcpEngine`] for TCP runs and
//! [`udp::UdpDatagramDriver`] for datagram runs. Both speak a minimal frame
//! format of their own; point them at a peer that speaks the same frames.

pub mod tcp;
pub mod udp;
