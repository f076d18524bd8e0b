//! Resolved socket addresses attached to HTTP/WAS/FastCGI addresses.

use std::fmt;
use std::net::SocketAddr;

/// One resolved peer address: either an internet socket address or an
/// `AF_LOCAL` path (with `@` marking the abstract namespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddress {
    Inet(SocketAddr),
    Local(String),
}

impl ResolvedAddress {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => addr.fmt(f),
            Self::Local(path) => f.write_str(path),
        }
    }
}

/// An ordered list of peer addresses to connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    addresses: Vec<ResolvedAddress>,
}

impl AddressList {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.addresses.len() == 1
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn front(&self) -> Option<&ResolvedAddress> {
        self.addresses.first()
    }

    pub fn push(&mut self, address: ResolvedAddress) {
        self.addresses.push(address);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedAddress> {
        self.addresses.iter()
    }
}
