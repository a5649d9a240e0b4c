//! Per-iteration completion state machines.
//!
//! These types know nothing about the ring. Each takes a decoded token plus
//! the raw completion result and decides whether the phase is finished, still
//! waiting, or needs a corrected operation resubmitted. The event loop only
//! moves entries between the ring and these machines.

use super::endpoint::Endpoint;
use super::error::{is_retryable, EngineError};
use super::metrics::Metrics;
use super::token::Op;
use std::io;

/// Which copy of the stream a destination receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Back to the sender on the primary connection.
    Echo,
    /// To the secondary connection.
    Observer,
}

/// Result of applying one completion.
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    /// Keep waiting for the phase's other completions.
    Wait,
    /// Submit this operation, then keep waiting.
    Resubmit(Op),
    /// The phase is finished.
    Done(T),
}

/// How the duplication phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// The source returned zero bytes.
    EndOfStream,
    /// Both pipes hold this many bytes of the same slice.
    Forward(usize),
}

/// Translate a negative completion into a retry or a fatal error.
fn failed<T>(op: Op, result: i32, metrics: &mut Metrics) -> Result<Step<T>, EngineError> {
    let errno = -result;
    if is_retryable(errno) {
        metrics.interrupted += 1;
        Ok(Step::Resubmit(op))
    } else {
        Err(EngineError::Io {
            op,
            source: io::Error::from_raw_os_error(errno),
        })
    }
}

/// Phase 1 of the zero-copy strategy: a drain into pipe A hard-linked to a
/// duplicate from pipe A into pipe B.
#[derive(Debug, Default)]
pub struct DrainTee {
    drained: Option<usize>,
    duplicated: Option<usize>,
}

impl DrainTee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_completion(
        &mut self,
        op: Op,
        result: i32,
        metrics: &mut Metrics,
    ) -> Result<Step<Intake>, EngineError> {
        if result < 0 {
            return failed(op, result, metrics);
        }
        let n = (result as usize).min(op.len());

        match op {
            Op::Relay { .. } if self.drained.is_none() => {
                if n == 0 {
                    return Ok(Step::Done(Intake::EndOfStream));
                }
                if n < op.len() {
                    metrics.short_reads += 1;
                }
                self.drained = Some(n);
            }
            Op::Duplicate { .. } if self.duplicated.is_none() => {
                if n < op.len() {
                    metrics.short_writes_pipe += 1;
                }
                self.duplicated = Some(n);
            }
            _ => return Err(EngineError::UnexpectedCompletion(op)),
        }

        match (self.drained, self.duplicated) {
            (Some(drained), Some(duplicated)) => {
                Ok(Step::Done(Intake::Forward(drained.min(duplicated))))
            }
            _ => Ok(Step::Wait),
        }
    }

    /// Bytes the drain put in pipe A that the duplicate did not copy.
    ///
    /// They stay at the head of pipe A after the forwarded amount is relayed
    /// and must be duplicated before the next drain.
    pub fn backlog(&self) -> usize {
        match (self.drained, self.duplicated) {
            (Some(drained), Some(duplicated)) => drained.saturating_sub(duplicated),
            _ => 0,
        }
    }
}

/// Catch-up duplicate of a pipe A backlog into pipe B.
///
/// Pipe A already holds every byte requested, so the duplicate never waits;
/// a zero-byte result means no progress is possible.
pub fn on_duplicate(
    op: Op,
    result: i32,
    metrics: &mut Metrics,
) -> Result<Step<usize>, EngineError> {
    if !matches!(op, Op::Duplicate { .. }) {
        return Err(EngineError::UnexpectedCompletion(op));
    }
    if result < 0 {
        return failed(op, result, metrics);
    }
    let n = (result as usize).min(op.len());
    if n == 0 {
        return Err(EngineError::WriteZero {
            op,
            owed: op.len(),
        });
    }
    if n < op.len() {
        metrics.short_writes_pipe += 1;
    }
    Ok(Step::Done(n))
}

/// Read phase of the buffer relay strategy: one receive into the block.
pub fn on_receive(
    op: Op,
    result: i32,
    metrics: &mut Metrics,
) -> Result<Step<Intake>, EngineError> {
    if !matches!(op, Op::Receive { .. }) {
        return Err(EngineError::UnexpectedCompletion(op));
    }
    if result < 0 {
        return failed(op, result, metrics);
    }
    let n = (result as usize).min(op.len());
    if n == 0 {
        return Ok(Step::Done(Intake::EndOfStream));
    }
    if n < op.len() {
        metrics.short_reads += 1;
    }
    Ok(Step::Done(Intake::Forward(n)))
}

#[derive(Debug)]
struct Leg {
    dest: Endpoint,
    destination: Destination,
    owed: usize,
}

/// Fan-out phase shared by both strategies: two independent writes of the
/// same amount, each retried until fully delivered.
#[derive(Debug)]
pub struct FanOut {
    legs: [Leg; 2],
}

impl FanOut {
    /// Track `ops`, each of which must name its destination endpoint.
    pub fn new(ops: [(Op, Destination); 2]) -> Self {
        let leg = |(op, destination): (Op, Destination)| Leg {
            dest: op.dest().unwrap_or(Endpoint::new(0)),
            destination,
            owed: op.len(),
        };
        let [a, b] = ops;
        Self {
            legs: [leg(a), leg(b)],
        }
    }

    /// Whether both destinations have received everything.
    pub fn is_complete(&self) -> bool {
        self.legs.iter().all(|leg| leg.owed == 0)
    }

    pub fn on_completion(
        &mut self,
        op: Op,
        result: i32,
        metrics: &mut Metrics,
    ) -> Result<Step<()>, EngineError> {
        let Some(leg) = self
            .legs
            .iter_mut()
            .find(|leg| Some(leg.dest) == op.dest() && leg.owed > 0)
        else {
            return Err(EngineError::UnexpectedCompletion(op));
        };
        // A resubmission always asks for exactly what is still owed.
        if op.len() != leg.owed || matches!(op, Op::Receive { .. } | Op::Duplicate { .. }) {
            return Err(EngineError::UnexpectedCompletion(op));
        }

        if result < 0 {
            return failed(op, result, metrics);
        }
        if result == 0 {
            return Err(EngineError::WriteZero {
                op,
                owed: leg.owed,
            });
        }

        let n = (result as usize).min(leg.owed);
        metrics.bytes_sent += n as u64;
        leg.owed -= n;

        if leg.owed > 0 {
            match leg.destination {
                Destination::Echo => metrics.short_writes_echo += 1,
                Destination::Observer => metrics.short_writes_observer += 1,
            }
            return Ok(Step::Resubmit(op.with_len(leg.owed)));
        }

        if self.is_complete() {
            Ok(Step::Done(()))
        } else {
            Ok(Step::Wait)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: Endpoint = Endpoint::new(0);
    const SECONDARY: Endpoint = Endpoint::new(1);
    const PIPE_A_READ: Endpoint = Endpoint::new(2);
    const PIPE_A_WRITE: Endpoint = Endpoint::new(3);
    const PIPE_B_READ: Endpoint = Endpoint::new(4);
    const PIPE_B_WRITE: Endpoint = Endpoint::new(5);

    fn owed(fan: &FanOut, destination: Destination) -> usize {
        fan.legs
            .iter()
            .filter(|leg| leg.destination == destination)
            .map(|leg| leg.owed)
            .sum()
    }

    fn drain(len: usize) -> Op {
        Op::Relay {
            from: PRIMARY,
            to: PIPE_A_WRITE,
            len,
        }
    }

    fn tee(len: usize) -> Op {
        Op::Duplicate {
            from: PIPE_A_READ,
            to: PIPE_B_WRITE,
            len,
        }
    }

    fn relays(len: usize) -> [(Op, Destination); 2] {
        [
            (
                Op::Relay {
                    from: PIPE_A_READ,
                    to: PRIMARY,
                    len,
                },
                Destination::Echo,
            ),
            (
                Op::Relay {
                    from: PIPE_B_READ,
                    to: SECONDARY,
                    len,
                },
                Destination::Observer,
            ),
        ]
    }

    #[test]
    fn test_drain_tee_forwards_full_block() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        assert_eq!(
            phase.on_completion(drain(4096), 4096, &mut metrics).unwrap(),
            Step::Wait
        );
        assert_eq!(
            phase.on_completion(tee(4096), 4096, &mut metrics).unwrap(),
            Step::Done(Intake::Forward(4096))
        );
        assert_eq!(metrics.short_reads, 0);
    }

    #[test]
    fn test_forward_amount_is_minimum() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        phase.on_completion(drain(4096), 3000, &mut metrics).unwrap();
        let step = phase.on_completion(tee(4096), 2500, &mut metrics).unwrap();
        assert_eq!(step, Step::Done(Intake::Forward(2500)));
        assert_eq!(metrics.short_reads, 1);
        assert_eq!(metrics.short_writes_pipe, 1);

        // Completion order does not matter.
        let mut phase = DrainTee::new();
        phase.on_completion(tee(4096), 1200, &mut metrics).unwrap();
        let step = phase.on_completion(drain(4096), 1800, &mut metrics).unwrap();
        assert_eq!(step, Step::Done(Intake::Forward(1200)));

        // Both relays then carry exactly that amount.
        let fan = FanOut::new(relays(1200));
        assert_eq!(owed(&fan, Destination::Echo), 1200);
        assert_eq!(owed(&fan, Destination::Observer), 1200);
    }

    #[test]
    fn test_zero_drain_is_end_of_stream() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        let step = phase.on_completion(drain(4096), 0, &mut metrics).unwrap();
        assert_eq!(step, Step::Done(Intake::EndOfStream));
    }

    #[test]
    fn test_interrupted_drain_is_resubmitted() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        let step = phase
            .on_completion(drain(4096), -libc::EINTR, &mut metrics)
            .unwrap();
        assert_eq!(step, Step::Resubmit(drain(4096)));
        assert_eq!(metrics.interrupted, 1);

        phase.on_completion(tee(4096), 4096, &mut metrics).unwrap();
        let step = phase.on_completion(drain(4096), 4096, &mut metrics).unwrap();
        assert_eq!(step, Step::Done(Intake::Forward(4096)));
    }

    #[test]
    fn test_interrupted_drain_leaves_backlog() {
        // The linked duplicate wakes on the retried drain's first bytes.
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        let step = phase
            .on_completion(drain(4096), -libc::EINTR, &mut metrics)
            .unwrap();
        assert_eq!(step, Step::Resubmit(drain(4096)));
        phase.on_completion(tee(4096), 1000, &mut metrics).unwrap();
        let step = phase.on_completion(drain(4096), 4096, &mut metrics).unwrap();
        assert_eq!(step, Step::Done(Intake::Forward(1000)));
        assert_eq!(phase.backlog(), 3096);

        // Catching up copies exactly the backlog into pipe B.
        let catch_up = tee(phase.backlog());
        assert_eq!(
            on_duplicate(catch_up, 3096, &mut metrics).unwrap(),
            Step::Done(3096)
        );
    }

    #[test]
    fn test_backlog_is_zero_when_in_step() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();
        assert_eq!(phase.backlog(), 0);

        phase.on_completion(drain(4096), 2048, &mut metrics).unwrap();
        assert_eq!(phase.backlog(), 0);
        phase.on_completion(tee(4096), 2048, &mut metrics).unwrap();
        assert_eq!(phase.backlog(), 0);
    }

    #[test]
    fn test_catch_up_duplicate_outcomes() {
        let mut metrics = Metrics::default();

        assert_eq!(
            on_duplicate(tee(3096), 2000, &mut metrics).unwrap(),
            Step::Done(2000)
        );
        assert_eq!(metrics.short_writes_pipe, 1);
        assert_eq!(
            on_duplicate(tee(1096), -libc::EAGAIN, &mut metrics).unwrap(),
            Step::Resubmit(tee(1096))
        );
        assert!(matches!(
            on_duplicate(tee(1096), 0, &mut metrics),
            Err(EngineError::WriteZero { owed: 1096, .. })
        ));
        assert!(matches!(
            on_duplicate(drain(1096), 1096, &mut metrics),
            Err(EngineError::UnexpectedCompletion(_))
        ));
    }

    #[test]
    fn test_drain_error_is_fatal() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        let err = phase
            .on_completion(drain(4096), -libc::ECONNRESET, &mut metrics)
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::ECONNRESET));
    }

    #[test]
    fn test_duplicate_completion_twice_is_unexpected() {
        let mut metrics = Metrics::default();
        let mut phase = DrainTee::new();

        phase.on_completion(tee(4096), 10, &mut metrics).unwrap();
        assert!(matches!(
            phase.on_completion(tee(4096), 10, &mut metrics),
            Err(EngineError::UnexpectedCompletion(_))
        ));
    }

    #[test]
    fn test_receive_outcomes() {
        let mut metrics = Metrics::default();
        let recv = Op::Receive {
            from: PRIMARY,
            len: 4096,
        };

        assert_eq!(
            on_receive(recv, 4096, &mut metrics).unwrap(),
            Step::Done(Intake::Forward(4096))
        );
        assert_eq!(
            on_receive(recv, 100, &mut metrics).unwrap(),
            Step::Done(Intake::Forward(100))
        );
        assert_eq!(metrics.short_reads, 1);
        assert_eq!(
            on_receive(recv, 0, &mut metrics).unwrap(),
            Step::Done(Intake::EndOfStream)
        );
        assert_eq!(
            on_receive(recv, -libc::EINTR, &mut metrics).unwrap(),
            Step::Resubmit(recv)
        );
        assert!(on_receive(drain(1), 1, &mut metrics).is_err());
    }

    #[test]
    fn test_fan_out_completes_in_either_order() {
        let mut metrics = Metrics::default();
        let ops = relays(4096);
        let mut fan = FanOut::new(ops);

        assert_eq!(
            fan.on_completion(ops[1].0, 4096, &mut metrics).unwrap(),
            Step::Wait
        );
        assert_eq!(
            fan.on_completion(ops[0].0, 4096, &mut metrics).unwrap(),
            Step::Done(())
        );
        assert_eq!(metrics.bytes_sent, 8192);
        assert_eq!(metrics.short_writes(), 0);
    }

    #[test]
    fn test_short_writes_converge() {
        // Each completion delivers one byte less than asked for, until only a
        // single byte is owed and it arrives whole.
        let total = 64;
        let mut metrics = Metrics::default();
        let ops = relays(total);
        let mut fan = FanOut::new(ops);
        let mut pending = vec![ops[0].0, ops[1].0];
        let mut delivered = [0usize; 2];
        let mut done = false;

        while let Some(op) = pending.pop() {
            assert!(!done, "phase finished with work pending");
            let result = if op.len() > 1 { op.len() - 1 } else { op.len() };
            let slot = if op.dest() == Some(PRIMARY) { 0 } else { 1 };
            delivered[slot] += result;

            match fan.on_completion(op, result as i32, &mut metrics).unwrap() {
                Step::Resubmit(next) => {
                    assert_eq!(next.dest(), op.dest());
                    assert_eq!(next.len(), op.len() - result);
                    pending.insert(0, next);
                }
                Step::Wait => {}
                Step::Done(()) => done = true,
            }
        }

        assert!(done);
        assert!(fan.is_complete());
        assert_eq!(delivered, [total, total]);
        assert_eq!(metrics.bytes_sent, 2 * total as u64);
        // total-1 bytes, then 1 byte: one short completion each.
        assert_eq!(metrics.short_writes_echo, 1);
        assert_eq!(metrics.short_writes_observer, 1);
    }

    #[test]
    fn test_send_remainder_keeps_destination() {
        let mut metrics = Metrics::default();
        let ops = [
            (Op::Send { to: PRIMARY, len: 100 }, Destination::Echo),
            (
                Op::Send {
                    to: SECONDARY,
                    len: 100,
                },
                Destination::Observer,
            ),
        ];
        let mut fan = FanOut::new(ops);

        let step = fan.on_completion(ops[0].0, 30, &mut metrics).unwrap();
        assert_eq!(step, Step::Resubmit(Op::Send { to: PRIMARY, len: 70 }));
        assert_eq!(owed(&fan, Destination::Echo), 70);

        // The stale full-length token no longer matches what is owed.
        assert!(fan.on_completion(ops[0].0, 100, &mut metrics).is_err());
    }

    #[test]
    fn test_interrupted_write_is_resubmitted_unchanged() {
        let mut metrics = Metrics::default();
        let ops = relays(512);
        let mut fan = FanOut::new(ops);

        let step = fan
            .on_completion(ops[0].0, -libc::EINTR, &mut metrics)
            .unwrap();
        assert_eq!(step, Step::Resubmit(ops[0].0));
        assert_eq!(owed(&fan, Destination::Echo), 512);
        assert_eq!(metrics.interrupted, 1);
    }

    #[test]
    fn test_zero_byte_write_is_fatal() {
        let mut metrics = Metrics::default();
        let ops = relays(512);
        let mut fan = FanOut::new(ops);

        assert!(matches!(
            fan.on_completion(ops[1].0, 0, &mut metrics),
            Err(EngineError::WriteZero { owed: 512, .. })
        ));
    }

    #[test]
    fn test_completion_for_unknown_destination() {
        let mut metrics = Metrics::default();
        let mut fan = FanOut::new(relays(8));
        let stray = Op::Relay {
            from: PIPE_A_READ,
            to: Endpoint::new(9),
            len: 8,
        };
        assert!(matches!(
            fan.on_completion(stray, 8, &mut metrics),
            Err(EngineError::UnexpectedCompletion(_))
        ));
    }
}
