//! Per-engine transfer counters.

/// Counters owned by one engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Bytes delivered, summed over both destinations.
    pub bytes_sent: u64,
    /// Completed duplication rounds.
    pub iterations: u64,
    /// Reads or drains that returned less than a full block.
    pub short_reads: u64,
    /// Short writes on the echo path.
    pub short_writes_echo: u64,
    /// Short writes on the observer path.
    pub short_writes_observer: u64,
    /// Duplicates that copied less than requested.
    pub short_writes_pipe: u64,
    /// Operations resubmitted after `EINTR` or `EAGAIN`.
    pub interrupted: u64,
}

impl Metrics {
    /// Short writes across both destinations.
    pub fn short_writes(&self) -> u64 {
        self.short_writes_echo + self.short_writes_observer
    }
}
