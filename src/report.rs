//! Periodic throughput and resource-usage reporting.
//!
//! The engine hands its counters to [`Reporter::observe`] once per iteration.
//! Every few milliseconds the reporter feeds the byte counter to a
//! [`RateEstimator`]; once per report interval it also samples `getrusage` and
//! emits one line with the change since the previous line, to the log and to a
//! file.

use crate::rate::{Rate, RateEstimator};
use crate::runtime::Metrics;
use bytesize::ByteSize;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often the byte counter is sampled for the rate estimator.
const SAMPLE_PERIOD: Duration = Duration::from_millis(10);

/// Reporter settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    /// Time between report lines.
    pub interval: Duration,
    /// Trailing window of the throughput estimate.
    pub rate_window: Duration,
    /// File that receives a copy of every line.
    pub log_file: Option<PathBuf>,
}

/// Process resource counters from `getrusage(RUSAGE_SELF)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_user: Duration,
    pub cpu_system: Duration,
    pub minor_faults: u64,
    pub major_faults: u64,
    /// Voluntary context switches (yields).
    pub voluntary_switches: u64,
    /// Involuntary context switches (preemptions).
    pub involuntary_switches: u64,
}

impl ResourceUsage {
    pub fn current() -> io::Result<Self> {
        // SAFETY: rusage is plain old data; all-zero is a valid value.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `usage` is a valid out-pointer for the duration of the call.
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let timeval = |tv: libc::timeval| {
            Duration::from_secs(tv.tv_sec.max(0) as u64)
                + Duration::from_micros(tv.tv_usec.max(0) as u64)
        };
        Ok(Self {
            cpu_user: timeval(usage.ru_utime),
            cpu_system: timeval(usage.ru_stime),
            minor_faults: usage.ru_minflt.max(0) as u64,
            major_faults: usage.ru_majflt.max(0) as u64,
            voluntary_switches: usage.ru_nvcsw.max(0) as u64,
            involuntary_switches: usage.ru_nivcsw.max(0) as u64,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    when: Instant,
    metrics: Metrics,
    usage: ResourceUsage,
}

/// Emits one diagnostic line per interval.
pub struct Reporter {
    /// `None` disables report lines; rate sampling still happens.
    interval: Option<Duration>,
    start: Instant,
    snapshot: Snapshot,
    rate: RateEstimator,
    last_sample: Option<Instant>,
    log: Option<LineWriter<File>>,
}

impl Reporter {
    /// Create a reporter, truncating the log file if one is configured.
    pub fn new(settings: &ReportSettings) -> io::Result<Self> {
        let log = match &settings.log_file {
            Some(path) => Some(open_log(path)?),
            None => None,
        };
        let mut reporter = Self::build(Some(settings.interval), settings.rate_window);
        reporter.log = log;
        Ok(reporter)
    }

    /// A reporter that never prints.
    pub fn silent() -> Self {
        Self::build(None, Duration::from_secs(1))
    }

    fn build(interval: Option<Duration>, rate_window: Duration) -> Self {
        let start = Instant::now();
        Self {
            interval,
            start,
            snapshot: Snapshot {
                when: start,
                metrics: Metrics::default(),
                usage: ResourceUsage::current().unwrap_or_default(),
            },
            rate: RateEstimator::new(rate_window),
            last_sample: None,
            log: None,
        }
    }

    /// Record the engine's counters as of `now`, printing a line when due.
    pub fn observe(&mut self, now: Instant, metrics: &Metrics) {
        let due_sample = self
            .last_sample
            .map_or(true, |last| now.duration_since(last) >= SAMPLE_PERIOD);
        if due_sample {
            self.rate.update(now, metrics.bytes_sent);
            self.last_sample = Some(now);
        }

        let Some(interval) = self.interval else {
            return;
        };
        if now.duration_since(self.snapshot.when) < interval {
            return;
        }

        let usage = match ResourceUsage::current() {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "getrusage failed");
                self.snapshot.usage
            }
        };
        let line = format_line(
            now.duration_since(self.start),
            now.duration_since(self.snapshot.when),
            &self.rate,
            &self.snapshot.metrics,
            metrics,
            &self.snapshot.usage,
            &usage,
        );

        info!("{line}");
        if let Some(log) = self.log.as_mut() {
            let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            if let Err(e) = writeln!(log, "{stamp}\t{line}") {
                warn!(error = %e, "Failed to write report line");
            }
        }

        self.snapshot = Snapshot {
            when: now,
            metrics: *metrics,
            usage,
        };
    }
}

fn open_log(path: &Path) -> io::Result<LineWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(LineWriter::new(file))
}

/// Bytes per second, scaled to a readable unit.
pub fn human_rate(rate: Rate, window: Duration) -> String {
    match rate.per_second(window) {
        Rate::PerInterval(v) => format!("{}/s", ByteSize(v.max(0.0) as u64)),
        other => other.to_string(),
    }
}

/// Render one report line from two consecutive snapshots.
pub fn format_line(
    elapsed: Duration,
    span: Duration,
    rate: &RateEstimator,
    prev: &Metrics,
    cur: &Metrics,
    prev_usage: &ResourceUsage,
    cur_usage: &ResourceUsage,
) -> String {
    let secs = span.as_secs_f64().max(f64::EPSILON);
    let per_sec = |a: u64, b: u64| b.saturating_sub(a) as f64 / secs;
    let window = rate.interval();

    format!(
        "{} ms\t{} avg\t{} instant\t{:.1} short_reads/s\t{:.1} short_writes_echo/s\t\
         {:.1} short_writes_observer/s\t{:.1} short_writes_pipe/s\t{} cpu_user_ms\t\
         {} cpu_system_ms\t{:.1} minor_faults/s\t{:.1} major_faults/s\t{:.1} yields/s\t\
         {:.1} preempts/s",
        elapsed.as_millis(),
        human_rate(rate.average_rate(), window),
        human_rate(rate.instant_rate(), window),
        per_sec(prev.short_reads, cur.short_reads),
        per_sec(prev.short_writes_echo, cur.short_writes_echo),
        per_sec(prev.short_writes_observer, cur.short_writes_observer),
        per_sec(prev.short_writes_pipe, cur.short_writes_pipe),
        cur_usage.cpu_user.saturating_sub(prev_usage.cpu_user).as_millis(),
        cur_usage
            .cpu_system
            .saturating_sub(prev_usage.cpu_system)
            .as_millis(),
        per_sec(prev_usage.minor_faults, cur_usage.minor_faults),
        per_sec(prev_usage.major_faults, cur_usage.major_faults),
        per_sec(prev_usage.voluntary_switches, cur_usage.voluntary_switches),
        per_sec(prev_usage.involuntary_switches, cur_usage.involuntary_switches),
    )
}
