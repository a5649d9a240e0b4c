//! Linux io_uring backend.
//!
//! Zero-copy relay through kernel pipes (splice and tee), or a buffer relay
//! through one user-space block (recv and send). Both run on a single ring.

mod event_loop;
mod pipe;

pub use event_loop::Engine;
