// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-device FIFO queue and its single consumer loop.
//
// Each device identity owns exactly one `DeviceQueue`.  Its loop is the only
// code that touches the device, so at most one job per device is in flight.
// Between consecutive interactions the loop waits out the settle delay.
//
// Loop states:
//
//   Idle ──► Acquiring ──► Executing ──► Classifying ──► Idle
//                                            │
//                                            └──► (retry timer) ──► tail of queue
//
// A failed job that may retry leaves the loop and sits in the delayed set
// until its backoff elapses, then rejoins at the tail.  The loop meanwhile
// serves whatever else is pending.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use thermis_bridge::traits::PrintOptions;
use thermis_core::config::DispatchConfig;
use thermis_core::error::{DeviceError, DeviceStage};
use thermis_core::types::{DeviceIdentity, DeviceRef, JobId, Operation, PrintResult};

use crate::backend::{Backends, FamilyBackend};
use crate::classify::classify;
use crate::job::Job;
use crate::retry::{RetryDecision, RetryPolicy};

/// Message carried by jobs removed by a clear.
pub const CLEARED_MESSAGE: &str = "cleared";

/// Message carried by jobs still pending at shutdown.
pub const SHUTDOWN_MESSAGE: &str = "dispatcher shut down";

/// Observable state of a device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing in flight and nothing waiting on a backoff.
    Idle,
    /// Waiting on the device gate.
    Acquiring,
    /// Driver operation in progress.
    Executing,
    /// Deciding between success, retry, and terminal failure.
    Classifying,
    /// Nothing runnable; at least one job is waiting on its backoff.
    RetryWait,
}

impl QueueState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Acquiring,
            2 => Self::Executing,
            3 => Self::Classifying,
            4 => Self::RetryWait,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Acquiring => 1,
            Self::Executing => 2,
            Self::Classifying => 3,
            Self::RetryWait => 4,
        }
    }
}

struct Inner {
    pending: VecDeque<Job>,
    /// Jobs whose retry timer is running.
    delayed: HashMap<JobId, Job>,
    /// Bumped by every clear; a job dispatched under an older generation
    /// was in flight during a clear.
    generation: u64,
    closed: bool,
}

struct Shared {
    identity: DeviceIdentity,
    inner: Mutex<Inner>,
    wake: Notify,
    phase: AtomicU8,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, state: QueueState) {
        self.phase.store(state.as_u8(), Ordering::Release);
    }

    fn phase(&self) -> QueueState {
        QueueState::from_u8(self.phase.load(Ordering::Acquire))
    }
}

/// FIFO of jobs for one device, drained by a dedicated task.
pub struct DeviceQueue {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceQueue {
    /// Create the queue and start its loop on the current runtime.
    pub fn spawn(identity: DeviceIdentity, backends: Arc<Backends>, config: Arc<DispatchConfig>) -> Self {
        let shared = Arc::new(Shared {
            identity: identity.clone(),
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                delayed: HashMap::new(),
                generation: 0,
                closed: false,
            }),
            wake: Notify::new(),
            phase: AtomicU8::new(QueueState::Idle.as_u8()),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            backends,
            policy: RetryPolicy::from_config(&config),
            config,
            last_interaction: None,
        };
        let task = tokio::spawn(worker.run());
        info!(device = %identity, "device queue started");

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    /// Append a job.  Hands it back if the queue has been shut down.
    pub fn enqueue(&self, job: Job) -> std::result::Result<(), Job> {
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(job);
            }
            debug!(job = %job.id, device = %self.shared.identity, op = %job.operation.kind(), "job queued");
            inner.pending.push_back(job);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Jobs not yet finished and not in flight, backoffs included.
    pub fn pending_count(&self) -> usize {
        let inner = self.shared.lock();
        inner.pending.len() + inner.delayed.len()
    }

    pub fn state(&self) -> QueueState {
        let phase = self.shared.phase();
        if phase != QueueState::Idle {
            return phase;
        }
        let inner = self.shared.lock();
        if inner.pending.is_empty() && !inner.delayed.is_empty() {
            QueueState::RetryWait
        } else {
            QueueState::Idle
        }
    }

    /// Remove every pending job and settle it as cancelled.
    ///
    /// The in-flight job, if any, is left to finish.  Returns the number of
    /// jobs removed.
    pub fn clear(&self) -> usize {
        let drained = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            drain(&mut inner)
        };
        let count = drained.len();
        for job in drained {
            job.settle(PrintResult::terminal(CLEARED_MESSAGE));
        }
        if count > 0 {
            info!(device = %self.shared.identity, count, "device queue cleared");
        }
        count
    }

    /// Refuse new work, settle what is pending, and wait for the loop to
    /// finish its in-flight job.
    pub async fn shutdown(&self) {
        let drained = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            drain(&mut inner)
        };
        for job in drained {
            job.settle(PrintResult::terminal(SHUTDOWN_MESSAGE));
        }
        self.shared.wake.notify_one();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(device = %self.shared.identity, error = %e, "device queue loop ended abnormally");
            }
        }
        info!(device = %self.shared.identity, "device queue stopped");
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("identity", &self.shared.identity)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Take every waiting job, queued ones first, then those on a backoff.
fn drain(inner: &mut Inner) -> Vec<Job> {
    let mut jobs: Vec<Job> = inner.pending.drain(..).collect();
    jobs.extend(inner.delayed.drain().map(|(_, job)| job));
    jobs
}

/// The consumer loop.
struct Worker {
    shared: Arc<Shared>,
    backends: Arc<Backends>,
    config: Arc<DispatchConfig>,
    policy: RetryPolicy,
    /// When the previous device interaction ended.
    last_interaction: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        while self.wait_for_work().await {
            self.settle_device().await;
            let Some((job, generation)) = self.take_next() else {
                continue;
            };

            let outcome = self.attempt(&job).await;
            self.last_interaction = Some(Instant::now());

            self.shared.set_phase(QueueState::Classifying);
            self.conclude(job, outcome, generation);
            self.shared.set_phase(QueueState::Idle);
        }
        debug!(device = %self.shared.identity, "device queue loop exiting");
    }

    /// Block until a job is pending.  `false` once the queue is closed.
    async fn wait_for_work(&self) -> bool {
        loop {
            {
                let inner = self.shared.lock();
                if inner.closed {
                    return false;
                }
                if !inner.pending.is_empty() {
                    return true;
                }
            }
            self.shared.wake.notified().await;
        }
    }

    /// Give the device its settle delay after the previous interaction.
    async fn settle_device(&self) {
        if let Some(last) = self.last_interaction {
            tokio::time::sleep_until(last + self.config.settle_delay()).await;
        }
    }

    fn take_next(&self) -> Option<(Job, u64)> {
        let mut inner = self.shared.lock();
        let job = inner.pending.pop_front()?;
        self.shared.set_phase(QueueState::Acquiring);
        Some((job, inner.generation))
    }

    /// One attempt, run on its own task so a panicking driver cannot take
    /// the loop down with it.
    async fn attempt(&self, job: &Job) -> std::result::Result<(), DeviceError> {
        let Some(backend) = self.backends.family(job.device.family).cloned() else {
            return Err(DeviceError::Other(format!(
                "no driver registered for {}",
                job.device.family.tag()
            )));
        };

        let attempt = Attempt {
            shared: Arc::clone(&self.shared),
            backend,
            device: job.device.clone(),
            operation: job.operation.clone(),
            bound: self.config.operation_timeout(job.operation.kind()),
            close_bound: self.config.close_timeout(),
        };
        debug!(job = %job.id, device = %job.device, attempt = job.attempt_count + 1, "job dispatched");

        match tokio::spawn(attempt.run()).await {
            Ok(outcome) => outcome,
            Err(e) => Err(DeviceError::Other(format!("driver task failed: {e}"))),
        }
    }

    fn conclude(&self, mut job: Job, outcome: std::result::Result<(), DeviceError>, generation: u64) {
        let err = match outcome {
            Ok(()) => {
                info!(job = %job.id, device = %job.device, op = %job.operation.kind(), "job completed");
                job.settle(PrintResult::Success);
                return;
            }
            Err(err) => err,
        };

        let (reason, retryable) = classify(&err);
        let message = err.to_string();

        match self.policy.decide(reason, job.attempt_count, job.max_retries) {
            RetryDecision::GiveUp => {
                warn!(job = %job.id, device = %job.device, %reason, error = %message, "job failed");
                job.settle(PrintResult::failed(reason, false, message));
            }
            RetryDecision::Exhausted => {
                warn!(job = %job.id, device = %job.device, %reason, error = %message, "job failed after retries");
                let message = format!("Max retries ({}) exceeded: {message}", job.max_retries);
                job.settle(PrintResult::failed(reason, false, message));
            }
            RetryDecision::RetryAfter(delay) => {
                if self.config.suppress_retry_after_clear && self.shared.lock().generation != generation {
                    info!(job = %job.id, device = %job.device, "queue cleared while in flight, not retrying");
                    job.settle(PrintResult::failed(
                        reason,
                        false,
                        format!("{message} (queue cleared, not retried)"),
                    ));
                    return;
                }
                job.attempt_count += 1;
                info!(
                    job = %job.id,
                    device = %job.device,
                    %reason,
                    retryable,
                    retry = job.attempt_count,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                self.schedule_retry(job, delay);
            }
        }
    }

    /// Park the job in the delayed set and re-enqueue it at the tail once
    /// `delay` has elapsed.  A clear or shutdown in the meantime takes it
    /// out of the set, which turns the timer into a no-op.
    fn schedule_retry(&self, job: Job, delay: Duration) {
        let id = job.id;
        let rejected = {
            let mut inner = self.shared.lock();
            if inner.closed {
                Some(job)
            } else {
                inner.delayed.insert(id, job);
                None
            }
        };
        if let Some(job) = rejected {
            job.settle(PrintResult::terminal(SHUTDOWN_MESSAGE));
            return;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let requeued = {
                let mut inner = shared.lock();
                match inner.delayed.remove(&id) {
                    Some(job) => {
                        inner.pending.push_back(job);
                        true
                    }
                    None => false,
                }
            };
            if requeued {
                shared.wake.notify_one();
            }
        });
    }
}

/// Everything one attempt needs, owned so it can run on its own task.
struct Attempt {
    shared: Arc<Shared>,
    backend: FamilyBackend,
    device: DeviceRef,
    operation: Operation,
    /// Budget for gate, open, and send together.
    bound: Duration,
    close_bound: Duration,
}

impl Attempt {
    async fn run(self) -> std::result::Result<(), DeviceError> {
        let deadline = Instant::now() + self.bound;

        let grant = timeout_at(deadline, self.backend.gate.acquire(&self.device, deadline))
            .await
            .map_err(|_| self.timed_out(DeviceStage::Acquire))??;

        self.shared.set_phase(QueueState::Executing);
        let mut conn = timeout_at(deadline, self.backend.driver.open(&grant))
            .await
            .map_err(|_| self.timed_out(DeviceStage::Open))??;

        let sent = match &self.operation {
            Operation::CheckConnection => Ok(()),
            Operation::Print { image, open_drawer } => {
                let options = PrintOptions {
                    open_drawer: *open_drawer,
                    cut_after: true,
                };
                timeout_at(deadline, conn.print_bitmap(image, options))
                    .await
                    .unwrap_or_else(|_| Err(self.timed_out(DeviceStage::Send)))
            }
            Operation::OpenDrawer => timeout_at(deadline, conn.open_cash_drawer())
                .await
                .unwrap_or_else(|_| Err(self.timed_out(DeviceStage::Send))),
            Operation::CutPaper => timeout_at(deadline, conn.cut_paper())
                .await
                .unwrap_or_else(|_| Err(self.timed_out(DeviceStage::Send))),
        };

        // Release the handle whatever the outcome; failures here never change it.
        match timeout(self.close_bound, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device = %self.device, error = %e, "failed to close device handle"),
            Err(_) => warn!(device = %self.device, "closing device handle timed out"),
        }

        sent
    }

    fn timed_out(&self, stage: DeviceStage) -> DeviceError {
        DeviceError::Timeout {
            stage,
            after: self.bound,
        }
    }
}
