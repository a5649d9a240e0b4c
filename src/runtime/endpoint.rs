//! Endpoint registry for descriptors named in completion tokens.
//!
//! Tokens have room for 14-bit endpoint handles, far fewer bits than a raw
//! file descriptor may need, so each descriptor the engine touches is
//! registered once and referred to by its slab index afterwards.

use super::token::{Op, MAX_ENDPOINT};
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;

/// Small integer handle for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(u16);

impl Endpoint {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> u16 {
        self.0
    }
}

/// What a registered descriptor is to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Source connection; also receives the echo.
    Primary,
    /// Observer connection; receives the duplicate.
    Secondary,
    /// Read end of a relay pipe.
    PipeRead,
    /// Write end of a relay pipe.
    PipeWrite,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    fd: RawFd,
    role: Role,
}

/// Registry mapping endpoint handles to descriptors.
///
/// Provides O(1) insert and lookup. The registry does not own the
/// descriptors.
pub struct EndpointTable {
    entries: Slab<Entry>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self {
            entries: Slab::with_capacity(8),
        }
    }

    /// Register a descriptor.
    ///
    /// Fails once the table holds more handles than a token can express.
    pub fn insert(&mut self, fd: RawFd, role: Role) -> io::Result<Endpoint> {
        let next = self.entries.vacant_key();
        if next > usize::from(MAX_ENDPOINT) {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "endpoint table exhausted",
            ));
        }
        let key = self.entries.insert(Entry { fd, role });
        Ok(Endpoint(key as u16))
    }

    fn fd(&self, endpoint: Endpoint) -> Option<RawFd> {
        self.entries.get(endpoint.0 as usize).map(|e| e.fd)
    }

    /// Role of a handle.
    pub fn role(&self, endpoint: Endpoint) -> Option<Role> {
        self.entries.get(endpoint.0 as usize).map(|e| e.role)
    }

    /// Descriptor behind a handle, or an error naming the missing handle.
    pub fn resolve(&self, endpoint: Endpoint) -> io::Result<RawFd> {
        self.fd(endpoint).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unregistered endpoint {}", endpoint.0),
            )
        })
    }

    /// Check that `op` names endpoints its kind can operate on.
    ///
    /// A duplicate runs between two pipes, a relay needs a pipe on at least
    /// one side, and sends and receives touch only the connections.
    pub fn check(&self, op: &Op) -> io::Result<()> {
        let role = |ep: Endpoint| self.role(ep);
        let is_conn = |r: Option<Role>| matches!(r, Some(Role::Primary | Role::Secondary));

        let valid = match *op {
            Op::Duplicate { from, to, .. } => {
                role(from) == Some(Role::PipeRead) && role(to) == Some(Role::PipeWrite)
            }
            Op::Relay { from, to, .. } => {
                role(from) == Some(Role::PipeRead) || role(to) == Some(Role::PipeWrite)
            }
            Op::Send { to, .. } => is_conn(role(to)),
            Op::Receive { from, .. } => is_conn(role(from)),
        };

        if valid {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{op:?} names endpoints of the wrong kind"),
            ))
        }
    }
}
