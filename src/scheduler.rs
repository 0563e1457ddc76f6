use crate::dedup::DedupGate;
use crate::error::{TrackerError, TrackerResult};
use crate::frame_lease::FrameLease;
use crate::pipeline::{CapturePipeline, TickOutcome};
use crate::session::SessionHandle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CaptureSchedule {
    pub every: Duration,
}

impl CaptureSchedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.every.is_zero() {
            return Err("interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Everything one scheduler run needs. The lease is held for the whole run and
/// dropped once the last in-flight tick has finished.
pub struct CaptureRun {
    pub session: SessionHandle,
    pub lease: FrameLease,
    pub gate: Arc<Mutex<DedupGate>>,
    pub pipeline: CapturePipeline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub ticks: u64,
    pub captures: u64,
    pub duplicates: u64,
    pub failures: u64,
    /// Ticks dropped because the previous one was still running or the session
    /// was not active.
    pub ignored: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    captures: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
    ignored: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

struct Attached {
    session_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

/// Drives the periodic capture for at most one session at a time.
#[derive(Default)]
pub struct CaptureScheduler {
    attached: Option<Attached>,
}

impl CaptureScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking every `every`; the first tick fires right away.
    pub fn start(&mut self, run: CaptureRun, every: Duration) -> TrackerResult<()> {
        CaptureSchedule { every }
            .validate()
            .map_err(TrackerError::InvalidConfig)?;

        if let Some(attached) = &self.attached
            && !attached.task.is_finished()
        {
            return Err(TrackerError::AlreadyRunning {
                session_id: attached.session_id.clone(),
            });
        }

        let session_id = run.lease.session_id().to_string();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run_loop(run, every, cancel.clone(), counters.clone()));
        tracing::info!(session_id = %session_id, every = ?every, "capture scheduler started");

        self.attached = Some(Attached {
            session_id,
            cancel,
            task,
            counters,
        });
        Ok(())
    }

    /// Stop ticking and wait for in-flight work. Calling it again, or on a
    /// scheduler that never started, returns `None`.
    pub async fn stop(&mut self) -> Option<CaptureStats> {
        Some(self.cancel()?.finished().await)
    }

    /// Stop ticking without waiting. The returned run still owns the frame
    /// lease until its in-flight ticks are done.
    pub fn cancel(&mut self) -> Option<StoppingRun> {
        let attached = self.attached.take()?;
        attached.cancel.cancel();
        Some(StoppingRun { attached })
    }

    /// False once stopped, and also once the loop ended on its own because the
    /// frame source went away.
    pub fn is_running(&self) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|attached| !attached.task.is_finished())
    }

}

/// A cancelled run whose last ticks may still be in flight.
pub struct StoppingRun {
    attached: Attached,
}

impl StoppingRun {
    pub fn session_id(&self) -> &str {
        &self.attached.session_id
    }

    /// Wait for the loop to exit, which releases the frame source.
    pub async fn finished(self) -> CaptureStats {
        let Attached {
            session_id,
            task,
            counters,
            ..
        } = self.attached;
        if let Err(err) = task.await {
            tracing::warn!(session_id = %session_id, error = %err, "capture loop ended abnormally");
        }

        let stats = counters.snapshot();
        tracing::info!(
            session_id = %session_id,
            ticks = stats.ticks,
            captures = stats.captures,
            duplicates = stats.duplicates,
            failures = stats.failures,
            ignored = stats.ignored,
            "capture scheduler stopped"
        );
        stats
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        if let Some(attached) = &self.attached {
            attached.cancel.cancel();
        }
    }
}

/// Resets the in-flight flag however the tick ends.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn try_enter(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_loop(
    run: CaptureRun,
    every: Duration,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let CaptureRun {
        session,
        lease,
        gate,
        pipeline,
    } = run;
    let lease = Arc::new(lease);
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut ticks = JoinSet::new();

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "capture tick panicked");
                }
            }
            _ = interval.tick() => {
                Counters::bump(&counters.ticks);
                if !session.is_active() {
                    Counters::bump(&counters.ignored);
                    tracing::debug!(session_id = lease.session_id(), "session not active, tick ignored");
                    continue;
                }
                let Some(guard) = InFlight::try_enter(&in_flight) else {
                    Counters::bump(&counters.ignored);
                    tracing::debug!(session_id = lease.session_id(), "previous tick still running, tick ignored");
                    continue;
                };

                let session = session.clone();
                let lease = Arc::clone(&lease);
                let gate = Arc::clone(&gate);
                let pipeline = pipeline.clone();
                let counters = Arc::clone(&counters);
                let cancel = cancel.clone();
                ticks.spawn(async move {
                    let _guard = guard;
                    match pipeline.run_tick(&session, &lease, &gate).await {
                        TickOutcome::Captured { duplicate } => {
                            Counters::bump(&counters.captures);
                            if duplicate {
                                Counters::bump(&counters.duplicates);
                            }
                        }
                        TickOutcome::CaptureFailed | TickOutcome::StorageFailed => {
                            Counters::bump(&counters.failures);
                        }
                        TickOutcome::SourceUnavailable(_) => {
                            Counters::bump(&counters.failures);
                            cancel.cancel();
                        }
                    }
                });
            }
        }
    }

    while let Some(joined) = ticks.join_next().await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "capture tick panicked");
        }
    }
    // Last reference: dropping it releases the frame source.
    drop(lease);
}
