//! io_uring duplication engine for Linux.
//!
//! Completion-based model: each iteration pushes one batch to the ring, then
//! drains completions until the cycle state machine reports the phase done.
//! Every entry's `user_data` is its encoded [`Op`], so completions are decoded
//! in place without any table of in-flight operations.

use super::pipe::Pipe;
use crate::config::Strategy;
use crate::report::Reporter;
use crate::runtime::cycle::{
    on_duplicate, on_receive, Destination, DrainTee, FanOut, Intake, Step,
};
use crate::runtime::{
    Block, Endpoint, EndpointTable, EngineError, Metrics, Op, Role, MAX_BYTES,
};
use io_uring::squeue::{self, Flags};
use io_uring::{opcode, types, IoUring};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Instant;
use tracing::{debug, info, trace};

/// One duplication engine: a ring plus the buffers its operations reference.
///
/// An engine runs once: [`Engine::run`] consumes it, because a duplicate
/// linked to the final drain may still be parked on the ring at
/// end-of-stream.
///
/// Field order matters: the ring is dropped first, so the kernel has
/// cancelled anything still in flight before the pipes and the block it
/// points at are released.
pub struct Engine {
    ring: IoUring,
    strategy: Strategy,
    block_size: usize,
    /// Pipe A feeds the echo, pipe B the observer (zero-copy relay only).
    pipes: Option<(Pipe, Pipe)>,
    /// Bytes at the head of pipe A not yet duplicated into pipe B.
    backlog: usize,
    /// Staging block (buffer relay only).
    block: Option<Block>,
    metrics: Metrics,
}

/// Endpoints registered for one run.
struct Wiring {
    endpoints: EndpointTable,
    primary: Endpoint,
    secondary: Endpoint,
}

impl Engine {
    /// Create an engine, its ring, and the buffers its strategy needs.
    pub fn new(
        strategy: Strategy,
        block_size: usize,
        ring_entries: u32,
    ) -> Result<Self, EngineError> {
        if block_size == 0 || block_size > MAX_BYTES {
            return Err(EngineError::Setup(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block size {block_size} outside 1..={MAX_BYTES}"),
            )));
        }

        let ring = IoUring::new(ring_entries).map_err(EngineError::Setup)?;

        let (pipes, block) = match strategy {
            Strategy::SpliceTee => {
                let a = Pipe::new(block_size).map_err(EngineError::Setup)?;
                let b = Pipe::new(block_size).map_err(EngineError::Setup)?;
                (Some((a, b)), None)
            }
            Strategy::RecvSend => (None, Some(Block::new(block_size))),
        };

        debug!(?strategy, block_size, ring_entries, "Engine created");

        Ok(Self {
            ring,
            strategy,
            block_size,
            pipes,
            backlog: 0,
            block,
            metrics: Metrics::default(),
        })
    }

    /// Duplicate `primary` onto itself and `secondary` until the primary
    /// reaches end-of-stream or an operation fails. Returns the final
    /// counters.
    pub fn run(
        mut self,
        primary: BorrowedFd<'_>,
        secondary: BorrowedFd<'_>,
        reporter: &mut Reporter,
    ) -> Result<Metrics, EngineError> {
        let mut endpoints = EndpointTable::new();
        let primary = endpoints
            .insert(primary.as_raw_fd(), Role::Primary)
            .map_err(EngineError::Setup)?;
        let secondary = endpoints
            .insert(secondary.as_raw_fd(), Role::Secondary)
            .map_err(EngineError::Setup)?;
        let wiring = Wiring {
            endpoints,
            primary,
            secondary,
        };

        info!(strategy = ?self.strategy, block_size = self.block_size, "Duplication started");

        let result = match self.strategy {
            Strategy::SpliceTee => self.run_splice_tee(wiring, reporter),
            Strategy::RecvSend => self.run_recv_send(wiring, reporter),
        };

        reporter.observe(Instant::now(), &self.metrics);
        result.map(|()| self.metrics)
    }

    fn run_splice_tee(
        &mut self,
        mut wiring: Wiring,
        reporter: &mut Reporter,
    ) -> Result<(), EngineError> {
        let Engine {
            ring,
            pipes,
            backlog,
            metrics,
            block_size,
            ..
        } = self;
        let (pipe_a, pipe_b) = pipes.as_ref().ok_or_else(|| {
            EngineError::Setup(io::Error::new(io::ErrorKind::Other, "relay pipes missing"))
        })?;

        let table = &mut wiring.endpoints;
        let a_read = table.insert(pipe_a.read_fd(), Role::PipeRead).map_err(EngineError::Setup)?;
        let a_write = table.insert(pipe_a.write_fd(), Role::PipeWrite).map_err(EngineError::Setup)?;
        let b_read = table.insert(pipe_b.read_fd(), Role::PipeRead).map_err(EngineError::Setup)?;
        let b_write = table.insert(pipe_b.write_fd(), Role::PipeWrite).map_err(EngineError::Setup)?;

        let drain = Op::Relay {
            from: wiring.primary,
            to: a_write,
            len: *block_size,
        };
        let duplicate = Op::Duplicate {
            from: a_read,
            to: b_write,
            len: *block_size,
        };

        loop {
            reporter.observe(Instant::now(), metrics);

            let amount = if *backlog > 0 {
                // A duplicate fell behind its drain. Copy the rest of pipe A
                // before draining more, so both pipes hold the same bytes.
                debug!(backlog = *backlog, "Duplicating pipe A backlog");
                let catch_up = Op::Duplicate {
                    from: a_read,
                    to: b_write,
                    len: *backlog,
                };
                push(ring, &[prepare(catch_up, &wiring.endpoints, None)?])?;
                let n = loop {
                    let (op, result) = next_completion(ring)?;
                    trace!(?op, result, "Catch-up completion");
                    match on_duplicate(op, result, metrics)? {
                        Step::Wait => {}
                        Step::Resubmit(op) => {
                            push(ring, &[prepare(op, &wiring.endpoints, None)?])?
                        }
                        Step::Done(n) => break n,
                    }
                };
                *backlog -= n;
                n
            } else {
                // The hard link starts the duplicate only once the drain has
                // finished filling pipe A, even when the drain comes up short.
                let batch = [
                    prepare(drain, &wiring.endpoints, None)?.flags(Flags::IO_HARDLINK),
                    prepare(duplicate, &wiring.endpoints, None)?,
                ];
                push(ring, &batch)?;

                let mut phase = DrainTee::new();
                let n = loop {
                    let (op, result) = next_completion(ring)?;
                    trace!(?op, result, "Intake completion");
                    match phase.on_completion(op, result, metrics)? {
                        Step::Wait => {}
                        Step::Resubmit(op) => {
                            push(ring, &[prepare(op, &wiring.endpoints, None)?])?
                        }
                        Step::Done(Intake::EndOfStream) => {
                            info!(bytes_sent = metrics.bytes_sent, "Nothing more to read");
                            return Ok(());
                        }
                        Step::Done(Intake::Forward(n)) => break n,
                    }
                };
                *backlog = phase.backlog();
                n
            };

            if amount > 0 {
                let legs = [
                    (
                        Op::Relay {
                            from: a_read,
                            to: wiring.primary,
                            len: amount,
                        },
                        Destination::Echo,
                    ),
                    (
                        Op::Relay {
                            from: b_read,
                            to: wiring.secondary,
                            len: amount,
                        },
                        Destination::Observer,
                    ),
                ];
                fan_out(ring, &wiring.endpoints, None, legs, metrics)?;
            }
            metrics.iterations += 1;
        }
    }

    fn run_recv_send(&mut self, wiring: Wiring, reporter: &mut Reporter) -> Result<(), EngineError> {
        let Engine {
            ring,
            block,
            metrics,
            ..
        } = self;
        let block = block.as_mut().ok_or_else(|| {
            EngineError::Setup(io::Error::new(io::ErrorKind::Other, "staging block missing"))
        })?;

        let receive = Op::Receive {
            from: wiring.primary,
            len: block.capacity(),
        };

        loop {
            reporter.observe(Instant::now(), metrics);

            // The read blocks this thread until data or end-of-stream arrives;
            // the two sends overlap only with each other.
            push(ring, &[prepare(receive, &wiring.endpoints, Some(&mut *block))?])?;
            let filled = loop {
                let (op, result) = next_completion(ring)?;
                trace!(?op, result, "Receive completion");
                match on_receive(op, result, metrics)? {
                    Step::Wait => {}
                    Step::Resubmit(op) => {
                        push(ring, &[prepare(op, &wiring.endpoints, Some(&mut *block))?])?
                    }
                    Step::Done(Intake::EndOfStream) => {
                        info!(bytes_sent = metrics.bytes_sent, "Nothing more to read");
                        return Ok(());
                    }
                    Step::Done(Intake::Forward(n)) => break n,
                }
            };
            block.set_filled(filled);

            let legs = [
                (
                    Op::Send {
                        to: wiring.primary,
                        len: filled,
                    },
                    Destination::Echo,
                ),
                (
                    Op::Send {
                        to: wiring.secondary,
                        len: filled,
                    },
                    Destination::Observer,
                ),
            ];
            fan_out(ring, &wiring.endpoints, Some(&mut *block), legs, metrics)?;
            metrics.iterations += 1;
        }
    }
}

/// Submit both legs, then resubmit remainders until both are delivered.
fn fan_out(
    ring: &mut IoUring,
    endpoints: &EndpointTable,
    mut block: Option<&mut Block>,
    legs: [(Op, Destination); 2],
    metrics: &mut Metrics,
) -> Result<(), EngineError> {
    let batch = [
        prepare(legs[0].0, endpoints, block.as_deref_mut())?,
        prepare(legs[1].0, endpoints, block.as_deref_mut())?,
    ];
    push(ring, &batch)?;

    let mut phase = FanOut::new(legs);
    loop {
        let (op, result) = next_completion(ring)?;
        trace!(?op, result, "Fan-out completion");
        match phase.on_completion(op, result, metrics)? {
            Step::Wait => {}
            Step::Resubmit(op) => {
                debug!(?op, "Resubmitting remainder");
                push(ring, &[prepare(op, endpoints, block.as_deref_mut())?])?;
            }
            Step::Done(()) => return Ok(()),
        }
    }
}

/// Build the submission entry for `op`, tagged with its own token.
///
/// Sends read the tail of the block's current chunk and receives fill the
/// block from the start, so `block` must be supplied for those kinds.
fn prepare(
    op: Op,
    endpoints: &EndpointTable,
    block: Option<&mut Block>,
) -> Result<squeue::Entry, EngineError> {
    let token = op.encode()?;
    endpoints
        .check(&op)
        .map_err(|source| EngineError::Io { op, source })?;
    let fd = |ep| {
        endpoints
            .resolve(ep)
            .map(types::Fd)
            .map_err(|source| EngineError::Io { op, source })
    };
    let missing_block = || EngineError::Io {
        op,
        source: io::Error::new(io::ErrorKind::InvalidInput, "no staging block"),
    };
    // Length fits: `encode` rejected anything above u32::MAX.
    let len = op.len() as u32;

    let entry = match op {
        Op::Duplicate { from, to, .. } => opcode::Tee::new(fd(from)?, fd(to)?, len).build(),
        Op::Relay { from, to, .. } => opcode::Splice::new(fd(from)?, -1, fd(to)?, -1, len).build(),
        Op::Send { to, len: remaining } => {
            let block = block.ok_or_else(missing_block)?;
            opcode::Send::new(fd(to)?, block.tail_ptr(remaining), len)
                .flags(libc::MSG_NOSIGNAL)
                .build()
        }
        Op::Receive { from, .. } => {
            let block = block.ok_or_else(missing_block)?;
            let buf = block.spare_mut();
            if buf.len() < op.len() {
                return Err(missing_block());
            }
            opcode::Recv::new(fd(from)?, buf.as_mut_ptr(), len).build()
        }
    };

    Ok(entry.user_data(token))
}

/// Push a batch atomically, flushing the queue first if it lacks room.
fn push(ring: &mut IoUring, batch: &[squeue::Entry]) -> Result<(), EngineError> {
    if batch.len() > ring.params().sq_entries() as usize {
        return Err(EngineError::SubmissionQueueFull {
            needed: batch.len(),
        });
    }

    for attempt in 0..2 {
        // SAFETY: every entry references descriptors registered for this run
        // and, for sends and receives, the engine's block. Both outlive the
        // ring, which is dropped first.
        let pushed = unsafe { ring.submission().push_multiple(batch) };
        if pushed.is_ok() {
            return Ok(());
        }
        if attempt == 0 {
            debug!(entries = batch.len(), "Submission queue full, flushing");
            submit(ring)?;
        }
    }

    Err(EngineError::SubmissionQueueFull {
        needed: batch.len(),
    })
}

fn submit(ring: &mut IoUring) -> Result<(), EngineError> {
    loop {
        match ring.submit() {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::Ring(e)),
        }
    }
}

/// Next completion, decoded. Submits anything pending and blocks if none is
/// ready yet.
fn next_completion(ring: &mut IoUring) -> Result<(Op, i32), EngineError> {
    loop {
        if let Some(cqe) = ring.completion().next() {
            let op = Op::decode(cqe.user_data())?;
            return Ok((op, cqe.result()));
        }

        match ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::Ring(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Stream, Transport};
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::os::fd::AsFd;
    use std::thread;

    const PAYLOAD: usize = 1_000_000;
    const BLOCK: usize = 4096;

    /// Build an engine, or `None` when the kernel refuses io_uring here.
    fn engine_or_skip(strategy: Strategy) -> Option<Engine> {
        match Engine::new(strategy, BLOCK, 8) {
            Ok(engine) => Some(engine),
            Err(e) if e.is_ring_unavailable() => {
                eprintln!("skipping: io_uring unavailable: {e}");
                None
            }
            Err(e) => panic!("engine setup failed: {e}"),
        }
    }

    fn read_all(mut stream: Stream) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).unwrap();
            out
        })
    }

    /// Send one megabyte of zeros through the engine and collect both copies.
    fn duplicate_megabyte(transport: Transport, strategy: Strategy) {
        let Some(engine) = engine_or_skip(strategy) else {
            return;
        };

        let echo_listener = transport.create_listener(1).unwrap();
        let observer_listener = transport.create_listener(1).unwrap();

        let client = transport.connect_to(&echo_listener).unwrap();
        let observer = transport.connect_to(&observer_listener).unwrap();
        let primary = echo_listener.accept().unwrap();
        let secondary = observer_listener.accept().unwrap();

        let mut writer = client.try_clone().unwrap();
        let sender = thread::spawn(move || {
            writer.write_all(&vec![0u8; PAYLOAD]).unwrap();
            writer.shutdown(Shutdown::Write).unwrap();
        });
        let echo = read_all(client);
        let observed = read_all(observer);

        let mut reporter = Reporter::silent();
        let metrics = engine
            .run(primary.as_fd(), secondary.as_fd(), &mut reporter)
            .unwrap();
        sender.join().unwrap();

        // Closing the server side lets both readers finish.
        drop(primary);
        drop(secondary);
        let echo = echo.join().unwrap();
        let observed = observed.join().unwrap();

        assert_eq!(echo.len(), PAYLOAD);
        assert_eq!(observed.len(), PAYLOAD);
        assert!(echo.iter().all(|&b| b == 0));
        assert_eq!(echo, observed);

        assert_eq!(metrics.bytes_sent, 2 * PAYLOAD as u64);
        assert_eq!(metrics.short_writes(), 0);
    }

    #[test]
    fn test_splice_tee_tcp() {
        duplicate_megabyte(Transport::tcp(), Strategy::SpliceTee);
    }

    #[test]
    fn test_recv_send_tcp() {
        duplicate_megabyte(Transport::tcp(), Strategy::RecvSend);
    }

    #[test]
    fn test_splice_tee_unix() {
        duplicate_megabyte(Transport::unix().unwrap(), Strategy::SpliceTee);
    }

    #[test]
    fn test_recv_send_unix() {
        duplicate_megabyte(Transport::unix().unwrap(), Strategy::RecvSend);
    }

    #[test]
    fn test_immediate_end_of_stream() {
        for strategy in [Strategy::SpliceTee, Strategy::RecvSend] {
            let Some(engine) = engine_or_skip(strategy) else {
                return;
            };
            let transport = Transport::tcp();
            let echo_listener = transport.create_listener(1).unwrap();
            let observer_listener = transport.create_listener(1).unwrap();
            let client = transport.connect_to(&echo_listener).unwrap();
            let _observer = transport.connect_to(&observer_listener).unwrap();
            let primary = echo_listener.accept().unwrap();
            let secondary = observer_listener.accept().unwrap();

            client.shutdown(Shutdown::Write).unwrap();
            let metrics = engine
                .run(primary.as_fd(), secondary.as_fd(), &mut Reporter::silent())
                .unwrap();
            assert_eq!(metrics.bytes_sent, 0);
            assert_eq!(metrics.iterations, 0);
        }
    }

    #[test]
    fn test_pipe_backlog_is_duplicated_before_next_drain() {
        // Pipe A holds bytes a short duplicate left behind after an
        // interrupted drain; both destinations must still see the same stream.
        const BACKLOG: usize = 3096;
        const WRITES: usize = 20;
        const WRITE_SIZE: usize = 500;

        let Some(mut engine) = engine_or_skip(Strategy::SpliceTee) else {
            return;
        };
        let stale = [0xAAu8; BACKLOG];
        let (pipe_a, _) = engine.pipes.as_ref().unwrap();
        // SAFETY: `stale` is valid for BACKLOG bytes; the pipe has room for it.
        let written = unsafe { libc::write(pipe_a.write_fd(), stale.as_ptr().cast(), BACKLOG) };
        assert_eq!(written, BACKLOG as isize);
        engine.backlog = BACKLOG;

        let transport = Transport::tcp();
        let echo_listener = transport.create_listener(1).unwrap();
        let observer_listener = transport.create_listener(1).unwrap();
        let client = transport.connect_to(&echo_listener).unwrap();
        let observer = transport.connect_to(&observer_listener).unwrap();
        let primary = echo_listener.accept().unwrap();
        let secondary = observer_listener.accept().unwrap();

        let mut writer = client.try_clone().unwrap();
        let sender = thread::spawn(move || {
            for _ in 0..WRITES {
                writer.write_all(&[0u8; WRITE_SIZE]).unwrap();
            }
            writer.shutdown(Shutdown::Write).unwrap();
        });
        let echo = read_all(client);
        let observed = read_all(observer);

        let metrics = engine
            .run(primary.as_fd(), secondary.as_fd(), &mut Reporter::silent())
            .unwrap();
        sender.join().unwrap();
        drop(primary);
        drop(secondary);
        let echo = echo.join().unwrap();
        let observed = observed.join().unwrap();

        let total = BACKLOG + WRITES * WRITE_SIZE;
        assert_eq!(echo.len(), total);
        assert_eq!(echo, observed);
        assert!(echo[..BACKLOG].iter().all(|&b| b == 0xAA));
        assert!(echo[BACKLOG..].iter().all(|&b| b == 0));
        assert_eq!(metrics.bytes_sent, 2 * total as u64);
    }

    #[test]
    fn test_rejects_empty_block() {
        assert!(matches!(
            Engine::new(Strategy::RecvSend, 0, 8),
            Err(EngineError::Setup(_))
        ));
    }
}
