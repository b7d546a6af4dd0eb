use crate::model::ServiceStatus;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

/// Stand-in deadline for delays too large to add to an instant
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Result of a start/stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Started,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
}

impl Toggle {
    pub fn message(&self) -> &'static str {
        match self {
            Toggle::Started => "Service started",
            Toggle::AlreadyRunning => "Service is already running",
            Toggle::Stopped => "Service stopped",
            Toggle::AlreadyStopped => "Service is not running",
        }
    }
}

/// One unit of background work, run repeatedly while a service is running.
#[async_trait]
pub trait Cycle: Send + Sync + 'static {
    async fn run_cycle(&self);

    /// Pause between the end of one cycle and the start of the next
    fn next_delay(&self) -> Duration;
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    processed_count: u64,
    error_count: u64,
    last_activity_time: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Run-state and background loop of one service instance.
///
/// The flag and counters form a single critical section behind a std mutex
/// that is never held across an await. Start and stop are serialised through
/// the worker slot so a stop always drains the loop it was aimed at.
pub struct ServiceContext {
    name: &'static str,
    state: Mutex<RunState>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    rescheduled: Notify,
}

impl ServiceContext {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(RunState::default()),
            worker: tokio::sync::Mutex::new(None),
            rescheduled: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        // Counters stay meaningful even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn status(&self) -> ServiceStatus {
        let state = self.state();
        ServiceStatus {
            is_running: state.running,
            processed_count: state.processed_count,
            error_count: state.error_count,
            last_activity_time: state.last_activity_time,
            last_error: state.last_error.clone(),
        }
    }

    pub fn record_success(&self, processed: u64) {
        let mut state = self.state();
        state.processed_count += processed;
        state.last_activity_time = Some(Utc::now());
    }

    pub fn record_activity(&self) {
        self.state().last_activity_time = Some(Utc::now());
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut state = self.state();
        state.error_count += 1;
        state.last_error = Some(message.into());
        state.last_activity_time = Some(Utc::now());
    }

    /// Wake a sleeping loop so it picks up a changed delay
    pub fn reschedule(&self) {
        self.rescheduled.notify_waiters();
    }

    pub async fn start<C: Cycle>(self: &Arc<Self>, cycle: Arc<C>) -> Toggle {
        let mut worker = self.worker.lock().await;
        if let Some(current) = worker.as_ref() {
            if !current.handle.is_finished() {
                return Toggle::AlreadyRunning;
            }
            // The loop died without a stop request; reap it and start afresh
            if let Some(Worker { handle, .. }) = worker.take() {
                if let Err(e) = handle.await {
                    error!(service = self.name, error = %e, "Service loop ended abnormally");
                }
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        self.state().running = true;
        let handle = tokio::spawn(run_loop(Arc::clone(self), cycle, stop_rx));
        *worker = Some(Worker { stop, handle });

        info!(service = self.name, "Service started");
        Toggle::Started
    }

    /// Signal the loop and wait for its in-flight cycle to finish.
    pub async fn stop(&self) -> Toggle {
        let mut worker = self.worker.lock().await;
        let Some(Worker { stop, handle }) = worker.take() else {
            return Toggle::AlreadyStopped;
        };

        self.state().running = false;
        // The receiver only disappears once the loop has already exited
        let _ = stop.send(true);
        if let Err(e) = handle.await {
            error!(service = self.name, error = %e, "Service loop ended abnormally");
        }

        info!(service = self.name, "Service stopped");
        Toggle::Stopped
    }
}

/// Clears the running flag when the loop exits by any path, panics included
struct RunningFlag(Arc<ServiceContext>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        let mut state = self.0.state();
        if state.running {
            warn!(service = self.0.name, "Service loop exited while marked running");
            state.running = false;
        }
    }
}

async fn run_loop<C: Cycle>(
    ctx: Arc<ServiceContext>,
    cycle: Arc<C>,
    mut stop: watch::Receiver<bool>,
) {
    let _flag = RunningFlag(Arc::clone(&ctx));
    info!(service = ctx.name, "Service loop running");

    'outer: loop {
        if *stop.borrow() {
            break;
        }

        // Never interrupted: a stop request waits for the cycle to drain
        cycle.run_cycle().await;
        let finished = Instant::now();

        loop {
            let rescheduled = ctx.rescheduled.notified();
            let delay = cycle.next_delay();
            let deadline = finished
                .checked_add(delay)
                .or_else(|| Instant::now().checked_add(FAR_FUTURE))
                .unwrap_or(finished);
            tokio::select! {
                _ = stop.changed() => break 'outer,
                _ = sleep_until(deadline) => break,
                _ = rescheduled => continue,
            }
        }
    }

    info!(service = ctx.name, "Service loop exited");
}
