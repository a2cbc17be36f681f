//! Network adapter descriptors used by UDP broadcasts.
//!
//! Adapter enumeration proper belongs to the host application; the toolkit
//! only needs a name, an address and a broadcast address per adapter. The
//! convenience broadcast overloads default to
//! `PlatformSocket::network_adapters`.

use std::net::Ipv4Addr;

use crate::host::Host;

/// One broadcast-capable network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    /// Interface name, informational only.
    pub name: String,
    /// Interface address.
    pub address: Host,
    /// Directed broadcast address datagrams are sent to.
    pub broadcast: Host,
}

impl NetworkAdapter {
    /// Describe an adapter by its addresses.
    pub fn new(name: impl Into<String>, address: Host, broadcast: Host) -> Self {
        Self {
            name: name.into(),
            address,
            broadcast,
        }
    }

    /// The loopback interface.
    pub fn loopback() -> Self {
        Self::new("lo", Host::LOCALHOST, Host::LOCALHOST)
    }

    /// A pseudo-adapter targeting the limited broadcast address
    /// `255.255.255.255`.
    pub fn limited_broadcast() -> Self {
        Self::new(
            "broadcast",
            Host::ANY,
            Host::from(Ipv4Addr::BROADCAST),
        )
    }
}
