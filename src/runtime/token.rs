//! Completion token codec for io_uring correlation.
//!
//! Every submitted operation carries its own description in the 64-bit
//! `user_data` word, so a completion can be interpreted without looking up any
//! in-flight state:
//!
//! ```text
//!  63          50 49          36 35  33 32                             0
//! +--------------+--------------+------+--------------------------------+
//! |  dest (14)   |  source (14) | op(3)|       bytes_desired (33)       |
//! +--------------+--------------+------+--------------------------------+
//! ```

use super::endpoint::Endpoint;
use thiserror::Error;

const BYTES_BITS: u32 = 33;
const OP_BITS: u32 = 3;
const ENDPOINT_BITS: u32 = 14;

const OP_SHIFT: u32 = BYTES_BITS;
const SOURCE_SHIFT: u32 = OP_SHIFT + OP_BITS;
const DEST_SHIFT: u32 = SOURCE_SHIFT + ENDPOINT_BITS;

const BYTES_MASK: u64 = (1 << BYTES_BITS) - 1;
const OP_MASK: u64 = (1 << OP_BITS) - 1;
const ENDPOINT_MASK: u64 = (1 << ENDPOINT_BITS) - 1;

/// Largest byte count a token can describe.
///
/// The field is 33 bits wide but holds a non-negative magnitude, which the
/// kernel interfaces cap at `u32::MAX` anyway.
pub const MAX_BYTES: usize = u32::MAX as usize;

/// Largest endpoint handle a token can describe.
pub const MAX_ENDPOINT: u16 = ENDPOINT_MASK as u16;

const CODE_DUPLICATE: u64 = 0;
const CODE_RELAY: u64 = 1;
const CODE_SEND: u64 = 2;
const CODE_RECEIVE: u64 = 3;

/// Errors from packing or unpacking a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("byte count {0} exceeds token capacity of {MAX_BYTES}")]
    BytesOverflow(usize),
    #[error("endpoint handle {0} exceeds token capacity of {MAX_ENDPOINT}")]
    EndpointOverflow(u16),
    #[error("unknown operation code {0} in completion token")]
    UnknownOperation(u8),
}

/// An in-flight operation, as described by its completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Non-consuming copy from one pipe into another (`tee`).
    Duplicate {
        from: Endpoint,
        to: Endpoint,
        len: usize,
    },
    /// Consuming move between two descriptors, one of them a pipe (`splice`).
    Relay {
        from: Endpoint,
        to: Endpoint,
        len: usize,
    },
    /// Write from the engine's user-space block.
    Send { to: Endpoint, len: usize },
    /// Read into the engine's user-space block.
    Receive { from: Endpoint, len: usize },
}

impl Op {
    /// Bytes requested by this operation.
    pub fn len(&self) -> usize {
        match *self {
            Op::Duplicate { len, .. }
            | Op::Relay { len, .. }
            | Op::Send { len, .. }
            | Op::Receive { len, .. } => len,
        }
    }

    /// Endpoint data is taken from, if any.
    pub fn source(&self) -> Option<Endpoint> {
        match *self {
            Op::Duplicate { from, .. } | Op::Relay { from, .. } | Op::Receive { from, .. } => {
                Some(from)
            }
            Op::Send { .. } => None,
        }
    }

    /// Endpoint data is delivered to, if any.
    pub fn dest(&self) -> Option<Endpoint> {
        match *self {
            Op::Duplicate { to, .. } | Op::Relay { to, .. } | Op::Send { to, .. } => Some(to),
            Op::Receive { .. } => None,
        }
    }

    /// The same operation resized to `len` bytes.
    pub fn with_len(self, len: usize) -> Op {
        match self {
            Op::Duplicate { from, to, .. } => Op::Duplicate { from, to, len },
            Op::Relay { from, to, .. } => Op::Relay { from, to, len },
            Op::Send { to, .. } => Op::Send { to, len },
            Op::Receive { from, .. } => Op::Receive { from, len },
        }
    }

    fn code(&self) -> u64 {
        match self {
            Op::Duplicate { .. } => CODE_DUPLICATE,
            Op::Relay { .. } => CODE_RELAY,
            Op::Send { .. } => CODE_SEND,
            Op::Receive { .. } => CODE_RECEIVE,
        }
    }

    /// Pack into a `user_data` word.
    ///
    /// Oversized fields are rejected rather than truncated.
    pub fn encode(&self) -> Result<u64, TokenError> {
        let len = self.len();
        if len > MAX_BYTES {
            return Err(TokenError::BytesOverflow(len));
        }
        let source = pack_endpoint(self.source())?;
        let dest = pack_endpoint(self.dest())?;

        Ok(len as u64
            | (self.code() << OP_SHIFT)
            | (source << SOURCE_SHIFT)
            | (dest << DEST_SHIFT))
    }

    /// Unpack a `user_data` word produced by [`Op::encode`].
    pub fn decode(token: u64) -> Result<Op, TokenError> {
        let len = (token & BYTES_MASK) as usize;
        let code = (token >> OP_SHIFT) & OP_MASK;
        let from = Endpoint::new(((token >> SOURCE_SHIFT) & ENDPOINT_MASK) as u16);
        let to = Endpoint::new(((token >> DEST_SHIFT) & ENDPOINT_MASK) as u16);

        if len > MAX_BYTES {
            return Err(TokenError::BytesOverflow(len));
        }

        match code {
            CODE_DUPLICATE => Ok(Op::Duplicate { from, to, len }),
            CODE_RELAY => Ok(Op::Relay { from, to, len }),
            CODE_SEND => Ok(Op::Send { to, len }),
            CODE_RECEIVE => Ok(Op::Receive { from, len }),
            other => Err(TokenError::UnknownOperation(other as u8)),
        }
    }
}

fn pack_endpoint(endpoint: Option<Endpoint>) -> Result<u64, TokenError> {
    match endpoint {
        Some(ep) if ep.index() > MAX_ENDPOINT => Err(TokenError::EndpointOverflow(ep.index())),
        Some(ep) => Ok(u64::from(ep.index())),
        None => Ok(0),
    }
}
