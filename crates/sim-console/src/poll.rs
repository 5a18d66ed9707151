//! Cursor-based polling of a running simulation.
//!
//! `PollAccumulator` is the single owner of a run's generation sequence. Each
//! tick reads status, lists identifiers, fetches only the suffix it does not
//! hold yet (concurrently), and appends the batch in identifier order. The
//! poll thread publishes snapshots through a `PollSink`; `PollHandle` stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::api::{GenerationId, RunId, SimulationApi};
use crate::error::{Error, Result};
use crate::generation::{Generation, GenerationLog, average_fitness_series};
use crate::run::RunStatus;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PollEvent {
    /// Controller epoch of the run this poller serves.
    pub epoch: u64,
    pub kind: PollEventKind,
}

#[derive(Debug, Clone)]
pub enum PollEventKind {
    Progress {
        status: RunStatus,
        appended: usize,
        generations: GenerationLog,
    },
    TickFailed {
        error: String,
        consecutive: usize,
    },
    Stopped {
        error: String,
    },
}

pub trait PollSink: Send + Sync {
    fn emit(&self, ev: PollEvent);
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PollEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PollEvent>) -> Self {
        Self { tx }
    }
}

impl PollSink for ChannelSink {
    fn emit(&self, ev: PollEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Line-per-event progress for the CLI.
#[derive(Default)]
pub struct StdoutSink {
    started_at: Mutex<Option<Instant>>,
}

impl PollSink for StdoutSink {
    fn emit(&self, ev: PollEvent) {
        let elapsed = match self.started_at.lock() {
            Ok(mut g) => g.get_or_insert_with(Instant::now).elapsed(),
            Err(_) => Duration::ZERO,
        };
        match ev.kind {
            PollEventKind::Progress {
                status,
                appended,
                generations,
            } => {
                let latest = average_fitness_series(&generations)
                    .last()
                    .map(|(_, v)| format!("{v:.4}"))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "[{:>5}s] {status:<9} generations={} (+{appended}) avg_fitness={latest}",
                    elapsed.as_secs(),
                    generations.len()
                );
            }
            PollEventKind::TickFailed { error, consecutive } => {
                println!(
                    "[{:>5}s] WARN poll failed ({consecutive} in a row): {error}",
                    elapsed.as_secs()
                );
            }
            PollEventKind::Stopped { error } => {
                println!("[{:>5}s] STOPPED: {error}", elapsed.as_secs());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub status: RunStatus,
    pub appended: usize,
    pub generations: GenerationLog,
}

#[derive(Debug)]
pub struct PollAccumulator {
    run_id: RunId,
    generations: GenerationLog,
    status: RunStatus,
    parallelism: usize,
}

impl PollAccumulator {
    pub fn new(run_id: RunId, parallelism: usize) -> Self {
        Self {
            run_id,
            generations: Arc::new(Vec::new()),
            status: RunStatus::Pending,
            parallelism: parallelism.max(1),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn held(&self) -> usize {
        self.generations.len()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn generations(&self) -> GenerationLog {
        Arc::clone(&self.generations)
    }

    /// One poll round. Nothing is committed unless every fetch succeeded and
    /// `cancel` is still clear; returns `None` when cancelled mid-flight.
    pub fn tick(
        &mut self,
        api: &dyn SimulationApi,
        cancel: &CancelToken,
    ) -> Result<Option<TickReport>> {
        let status = api.run_status(&self.run_id)?;
        let ids = api.list_generations(&self.run_id)?;

        let held = self.held();
        let new_ids = ids.get(held..).unwrap_or_default();
        debug!(run = %self.run_id, %status, listed = ids.len(), held, "poll tick");

        let fetched = fetch_in_order(api, &self.run_id, new_ids, self.parallelism)?;

        if cancel.is_cancelled() {
            debug!(run = %self.run_id, "tick finished after cancellation; discarding");
            return Ok(None);
        }

        let appended = fetched.len();
        if appended > 0 {
            let mut next = Vec::with_capacity(held + appended);
            next.extend(self.generations.iter().map(Arc::clone));
            next.extend(fetched.into_iter().map(Arc::new));
            self.generations = Arc::new(next);
        }
        self.status = status;

        Ok(Some(TickReport {
            status,
            appended,
            generations: self.generations(),
        }))
    }
}

/// Fetch `ids` with up to `parallelism` requests in flight; the result keeps
/// the order of `ids` regardless of completion order.
fn fetch_in_order(
    api: &dyn SimulationApi,
    run_id: &RunId,
    ids: &[GenerationId],
    parallelism: usize,
) -> Result<Vec<Generation>> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(parallelism.max(1)) {
        let results: Vec<Result<Generation>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|gid| scope.spawn(move || api.get_generation(run_id, gid)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::msg("generation fetch panicked")))
                })
                .collect()
        });
        for r in results {
            out.push(r?);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub parallelism: usize,
    pub max_consecutive_failures: usize,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            parallelism: num_cpus::get().max(1),
            max_consecutive_failures: 5,
        }
    }
}

/// Owner's grip on a poll thread. Dropping it cancels the poller.
pub struct PollHandle {
    epoch: u64,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the poll thread to exit (after completion or `cancel`).
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start polling `run_id` for controller epoch `epoch`.
pub fn start_polling(
    api: Arc<dyn SimulationApi>,
    run_id: RunId,
    epoch: u64,
    opts: PollOptions,
    sink: Arc<dyn PollSink>,
) -> PollHandle {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let thread = std::thread::spawn(move || {
        poll_loop(api.as_ref(), run_id, epoch, &opts, sink.as_ref(), &token);
    });
    PollHandle {
        epoch,
        cancel,
        thread: Some(thread),
    }
}

fn poll_loop(
    api: &dyn SimulationApi,
    run_id: RunId,
    epoch: u64,
    opts: &PollOptions,
    sink: &dyn PollSink,
    cancel: &CancelToken,
) {
    info!(run = %run_id, epoch, interval_ms = opts.interval.as_millis() as u64, "polling started");
    let mut acc = PollAccumulator::new(run_id, opts.parallelism);
    let mut failures = 0usize;

    while !cancel.is_cancelled() {
        match acc.tick(api, cancel) {
            Ok(None) => break,
            Ok(Some(report)) => {
                failures = 0;
                let terminal = report.status.is_terminal();
                sink.emit(PollEvent {
                    epoch,
                    kind: PollEventKind::Progress {
                        status: report.status,
                        appended: report.appended,
                        generations: report.generations,
                    },
                });
                if terminal {
                    info!(run = %acc.run_id(), status = %report.status, held = acc.held(), "polling finished");
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                warn!(run = %acc.run_id(), error = %e, failures, "poll tick failed");
                if cancel.is_cancelled() {
                    break;
                }
                if failures >= opts.max_consecutive_failures.max(1) {
                    sink.emit(PollEvent {
                        epoch,
                        kind: PollEventKind::Stopped {
                            error: format!("polling stopped after {failures} failed attempts: {e}"),
                        },
                    });
                    return;
                }
                sink.emit(PollEvent {
                    epoch,
                    kind: PollEventKind::TickFailed {
                        error: e.to_string(),
                        consecutive: failures,
                    },
                });
            }
        }
        sleep_unless_cancelled(opts.interval, cancel);
    }
    debug!(run = %acc.run_id(), "polling cancelled");
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let step = Duration::from_millis(25);
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}
