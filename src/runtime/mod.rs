//! Duplication runtime.
//!
//! Platform-specific implementations:
//! - Linux: io_uring, with a zero-copy and a buffer relay strategy
//! - elsewhere: unsupported
//!
//! Both strategies share common abstractions:
//! - `Op`: operation descriptions packed into completion tokens
//! - `EndpointTable`: small handles for the descriptors a token names
//! - `cycle`: per-iteration completion state machines

mod buffer;
mod cycle;
mod endpoint;
mod error;
mod metrics;
mod token;

pub use error::EngineError;
pub use metrics::Metrics;

#[cfg(target_os = "linux")]
pub(crate) use buffer::Block;
#[cfg(target_os = "linux")]
pub(crate) use endpoint::{Endpoint, EndpointTable, Role};
#[cfg(target_os = "linux")]
pub(crate) use token::{Op, MAX_BYTES};

#[cfg(target_os = "linux")]
mod uring;

#[cfg(target_os = "linux")]
pub use uring::Engine;

use crate::config::Strategy;
use crate::report::Reporter;
use std::os::fd::BorrowedFd;

/// Duplicate `primary` onto itself and `secondary` with the chosen strategy.
///
/// Returns once the primary reaches end-of-stream, with the final counters.
pub fn run(
    strategy: Strategy,
    ring_entries: u32,
    block_size: usize,
    primary: BorrowedFd<'_>,
    secondary: BorrowedFd<'_>,
    reporter: &mut Reporter,
) -> Result<Metrics, EngineError> {
    #[cfg(target_os = "linux")]
    {
        Engine::new(strategy, block_size, ring_entries)?.run(primary, secondary, reporter)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (strategy, ring_entries, block_size, primary, secondary, reporter);
        Err(EngineError::Unsupported)
    }
}
