//! TCP reassembly and UDP flow building: turns decoded packets into the
//! `Connection` aggregate that analyzers and the agent operate on.

#![warn(missing_docs)]

pub mod connection;
pub mod tcp;
pub mod udp;

pub use connection::{Connection, ConnectionPool, PayloadBuffer, PayloadPool, TransportType};
pub use tcp::{TcpReassembler, TcpSegment};
pub use udp::{UdpDatagram, UdpFlowBuilder};
