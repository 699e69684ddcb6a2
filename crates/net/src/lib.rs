//! IPv4 networking: adapters, ARP, routing, UDP and TCP sockets, and
//! UNIX-domain sockets, all built on [`ksched::event::Event`] as the single
//! blocking primitive.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod adapter;
pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod ipv4;
pub mod port;
pub mod socket;
pub mod tcp;
pub mod types;
pub mod udp;
pub mod unix;

pub use adapter::{Adapter, AdapterConfig, AdapterDriver};
pub use socket::{MsgFlags, PollFlags, Socket, SockOpt, SocketFlags};
pub use tcp::{TcpSocket, TcpState};
pub use types::{Ipv4Addr, MacAddr};
pub use udp::UdpSocket;
pub use unix::UnixSocket;
