//! Continuous fan-out replication from one source to a live set of
//! destinations.
//!
//! One worker task owns the source and the destination set. Every
//! destination but the last receives each byte range through a
//! non-consuming tee; the last receives it through a consuming splice, so
//! the range leaves the source buffer exactly once. Destinations can be
//! added while the copier runs and individual destination failures never
//! disturb the rest of the set.

use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::pipe::{PipeReader, PipeWriter};
use crate::splice::{Budget, Descriptor, Stop, async_splice, async_tee};

/// Errors surfaced by the copier lifecycle.
///
/// Individual destination failures are internal bookkeeping, not errors;
/// a failing destination is evicted and everyone else keeps receiving.
#[derive(Debug, Error)]
pub enum CopierError {
    /// The copier has terminated; no further work is accepted.
    #[error("copier is closed")]
    Closed,
    /// Reading the source failed; the copier shut down.
    #[error("source descriptor failed")]
    Source(#[source] io::Error),
}

/// Lifecycle of a fan-out copier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopierState {
    /// No destinations and nothing pending.
    WaitingForWork,
    /// Destinations present; passes run as the source becomes readable.
    Copying,
    /// A terminal condition was recorded; no new passes start.
    Draining,
    /// Fully terminated.
    Closed,
}

struct Shared {
    gate: Mutex<Gate>,
    wake: Notify,
    cancel: CancellationToken,
}

struct Gate {
    pending: Vec<PipeWriter>,
    state: CopierState,
}

/// Replicates one source stream to a dynamically growing set of
/// destinations.
pub struct Copier {
    shared: Arc<Shared>,
    worker: JoinHandle<Result<(), CopierError>>,
}

impl Copier {
    /// Start a copier over `source`, replicating to `destinations`.
    ///
    /// The worker runs until the source ends or fails, or until `cancel`
    /// fires; [`Copier::join`] waits for it and reports the outcome.
    pub fn new(
        source: PipeReader,
        cancel: CancellationToken,
        destinations: Vec<PipeWriter>,
    ) -> Self {
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate {
                pending: Vec::new(),
                state: CopierState::WaitingForWork,
            }),
            wake: Notify::new(),
            cancel,
        });
        let worker = tokio::spawn(run(shared.clone(), source, destinations));
        Self { shared, worker }
    }

    /// Propose another destination.
    ///
    /// The destination only sees byte ranges from passes that begin after
    /// this call; it never receives backlog. Fails once the copier has
    /// terminated.
    pub fn add(&self, destination: PipeWriter) -> Result<(), CopierError> {
        {
            let mut gate = self.shared.gate.lock().unwrap();
            if gate.state == CopierState::Closed {
                return Err(CopierError::Closed);
            }
            gate.pending.push(destination);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CopierState {
        self.shared.gate.lock().unwrap().state
    }

    /// Wait until the worker has fully stopped and every destination
    /// descriptor is released. Returns the terminal source fault, if any;
    /// cancellation and source end of stream are clean outcomes.
    pub async fn join(self) -> Result<(), CopierError> {
        match self.worker.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "copier worker aborted");
                Err(CopierError::Closed)
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    source: PipeReader,
    mut destinations: Vec<PipeWriter>,
) -> Result<(), CopierError> {
    debug!(initial = destinations.len(), "fan-out worker started");
    let result = drive(&shared, &source, &mut destinations).await;

    {
        let mut gate = shared.gate.lock().unwrap();
        gate.state = CopierState::Closed;
        gate.pending.clear();
    }

    match &result {
        Ok(()) => debug!("fan-out worker stopped"),
        Err(e) => warn!(error = %e, "fan-out worker stopped on source fault"),
    }
    result
}

async fn drive(
    shared: &Shared,
    source: &PipeReader,
    destinations: &mut Vec<PipeWriter>,
) -> Result<(), CopierError> {
    loop {
        if merge_and_check(shared, destinations) {
            return Ok(());
        }

        if destinations.is_empty() {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.cancel.cancelled() => {}
            }
            continue;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => continue,
            _ = shared.wake.notified() => continue,
            ready = source.readiness().readable() => match ready {
                Ok(guard) => drop(guard),
                Err(e) => {
                    set_state(shared, CopierState::Draining);
                    return Err(CopierError::Source(e));
                }
            },
        }

        // Additions proposed while parked above belong to the pass that
        // is about to begin.
        if merge_and_check(shared, destinations) {
            return Ok(());
        }

        match fan_out_pass(shared, source, destinations).await {
            Ok(PassEnd::Continue) => {}
            Ok(PassEnd::Cancelled) => continue,
            Ok(PassEnd::SourceEof) => {
                set_state(shared, CopierState::Draining);
                trace!("source reached end of stream");
                return Ok(());
            }
            Err(e) => {
                set_state(shared, CopierState::Draining);
                return Err(CopierError::Source(e));
            }
        }
    }
}

/// Fold proposed additions into the set and observe cancellation. Returns
/// true when the copier should stop.
fn merge_and_check(shared: &Shared, destinations: &mut Vec<PipeWriter>) -> bool {
    let mut gate = shared.gate.lock().unwrap();
    if !gate.pending.is_empty() {
        trace!(added = gate.pending.len(), "merging proposed destinations");
        destinations.append(&mut gate.pending);
    }
    if shared.cancel.is_cancelled() {
        gate.state = CopierState::Draining;
        return true;
    }
    gate.state = if destinations.is_empty() {
        CopierState::WaitingForWork
    } else {
        CopierState::Copying
    };
    false
}

fn set_state(shared: &Shared, state: CopierState) {
    shared.gate.lock().unwrap().state = state;
}

enum PassEnd {
    Continue,
    Cancelled,
    SourceEof,
}

/// One coupled delivery attempt to every current destination.
///
/// The first surviving destination's actual progress fixes the byte count
/// the rest of the pass must reach, and the final destination consumes
/// exactly that range from the source. Destinations that fail, or that
/// cannot take the coupled range whole, are marked and dropped from the
/// set afterwards with a stable filter.
async fn fan_out_pass(
    shared: &Shared,
    source: &PipeReader,
    destinations: &mut Vec<PipeWriter>,
) -> io::Result<PassEnd> {
    let last = destinations.len() - 1;
    let mut faulted = vec![false; destinations.len()];
    let mut coupling: Option<u64> = None;
    let mut end = PassEnd::Continue;

    'pass: for (index, destination) in destinations.iter().enumerate() {
        if shared.cancel.is_cancelled() {
            end = PassEnd::Cancelled;
            break 'pass;
        }

        if index < last {
            let step = tokio::select! {
                _ = shared.cancel.cancelled() => {
                    end = PassEnd::Cancelled;
                    break 'pass;
                }
                step = async_tee(source.readiness(), destination.readiness(), coupling) => step,
            };
            match step {
                (moved, Stop::Done) => match coupling {
                    None => coupling = Some(moved),
                    Some(want) if moved < want => {
                        // A tee cannot resume after partial progress
                        // without re-duplicating the buffer head, so a
                        // lagging destination leaves the set.
                        debug!(index, moved, want, "destination missed a coupled range, evicting");
                        faulted[index] = true;
                    }
                    Some(_) => {}
                },
                (_, Stop::WouldBlock) => match coupling {
                    // The source has nothing to offer within this
                    // readiness event; the pass ends cleanly.
                    None => break 'pass,
                    // The coupled range vanished from under the pass;
                    // only an outside reader on the source can cause
                    // this. The destination cannot reach the count.
                    Some(want) => {
                        debug!(index, want, "coupled range no longer available, evicting");
                        faulted[index] = true;
                    }
                },
                (_, Stop::Eof) => {
                    end = PassEnd::SourceEof;
                    break 'pass;
                }
                (_, Stop::Fault(e)) => {
                    debug!(index, error = %e, "destination transfer failed, evicting");
                    faulted[index] = true;
                }
            }
        } else {
            let budget = match coupling {
                Some(n) => Budget::Limited(n),
                None => Budget::Unbounded,
            };
            let src_desc = Descriptor::Registered(source.readiness());
            let dst_desc = Descriptor::Registered(destination.readiness());
            let step = tokio::select! {
                _ = shared.cancel.cancelled() => {
                    end = PassEnd::Cancelled;
                    break 'pass;
                }
                step = async_splice(
                    &src_desc,
                    &dst_desc,
                    budget,
                    false,
                ) => step,
            };
            match step {
                (_, Stop::Done) => {}
                (moved, Stop::WouldBlock) => {
                    if let Some(want) = coupling {
                        debug!(index, moved, want, "coupled range no longer available, evicting");
                        faulted[index] = true;
                        discard_from_source(source, want - moved).await?;
                    }
                }
                (_, Stop::Eof) => {
                    end = PassEnd::SourceEof;
                }
                (moved, Stop::Fault(e)) => {
                    debug!(index, error = %e, "consuming destination failed, evicting");
                    faulted[index] = true;
                    if let Some(want) = coupling {
                        // Every surviving destination already holds the
                        // full range via tee; the unconsumed remainder
                        // must not reach them again next pass.
                        discard_from_source(source, want - moved).await?;
                    }
                }
            }
        }
    }

    if faulted.iter().any(|&mark| mark) {
        let mut marks = faulted.into_iter();
        destinations.retain(|_| !marks.next().unwrap_or(false));
    }

    Ok(end)
}

/// Consume and throw away `want` bytes from the source. Runs only when
/// the consuming destination of a coupled pass could not take the whole
/// range; the bytes are already delivered everywhere else.
async fn discard_from_source(source: &PipeReader, want: u64) -> io::Result<()> {
    let readiness = source.readiness();
    let mut remaining = want;
    let mut scratch = [0u8; 8192];

    while remaining > 0 {
        let mut guard = readiness.readable().await?;
        let len = scratch.len().min(remaining as usize);
        match guard.try_io(|inner| {
            nix::unistd::read(inner.get_ref(), &mut scratch[..len]).map_err(io::Error::from)
        }) {
            // Writer went away with the range partially queued; nothing
            // further can arrive, so there is nothing left to protect.
            Ok(Ok(0)) => break,
            Ok(Ok(drained)) => remaining -= drained as u64,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }

    trace!(discarded = want - remaining, "discarded undeliverable remainder");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn add_after_cancellation_fails_closed() {
        let (source_reader, _source_writer) = pipe().unwrap();
        let (_extra_reader, extra_writer) = pipe().unwrap();

        let cancel = CancellationToken::new();
        let copier = Copier::new(source_reader, cancel.clone(), Vec::new());
        cancel.cancel();

        // The worker observes cancellation and closes; add must then be
        // rejected. Poll because the worker runs concurrently.
        for _ in 0..100 {
            if copier.state() == CopierState::Closed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(copier.state(), CopierState::Closed);
        assert!(matches!(copier.add(extra_writer), Err(CopierError::Closed)));
        assert_ok!(copier.join().await);
    }

    #[tokio::test]
    async fn source_eof_closes_the_copier() {
        let (source_reader, source_writer) = pipe().unwrap();
        let (_dest_reader, dest_writer) = pipe().unwrap();

        let copier = Copier::new(
            source_reader,
            CancellationToken::new(),
            vec![dest_writer],
        );
        drop(source_writer);

        tokio::time::timeout(std::time::Duration::from_secs(5), copier.join())
            .await
            .expect("worker should stop on source EOF")
            .expect("EOF is a clean outcome");
    }
}
