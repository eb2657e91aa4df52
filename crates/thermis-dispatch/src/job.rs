// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A unit of work bound to one device, and the caller's handle on its result.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;

use thermis_core::types::{DeviceRef, JobId, Operation, PrintResult};

/// One operation aimed at one device.
///
/// Owned by exactly one device queue at a time.  Consumed by [`Job::settle`],
/// so a job can be settled at most once.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub operation: Operation,
    pub device: DeviceRef,
    pub created_at: DateTime<Utc>,
    /// Retries already spent.
    pub attempt_count: u32,
    pub max_retries: u32,
    completion: oneshot::Sender<PrintResult>,
}

impl Job {
    pub fn new(operation: Operation, device: DeviceRef, max_retries: u32) -> (Self, JobTicket) {
        let (tx, rx) = oneshot::channel();
        let id = JobId::new();
        let job = Self {
            id,
            operation,
            device,
            created_at: Utc::now(),
            attempt_count: 0,
            max_retries,
            completion: tx,
        };
        (job, JobTicket { id, rx })
    }

    /// Deliver the terminal result to the caller.
    pub fn settle(self, result: PrintResult) {
        let age_ms = (Utc::now() - self.created_at).num_milliseconds();
        debug!(
            job = %self.id,
            device = %self.device,
            attempts = self.attempt_count + 1,
            age_ms,
            success = result.is_success(),
            "job settled"
        );
        // The caller may have stopped waiting; the result is then dropped.
        let _ = self.completion.send(result);
    }
}

/// Caller-side handle resolving to the job's terminal result.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<PrintResult>,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn wait(self) -> PrintResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => PrintResult::terminal("job abandoned before completion"),
        }
    }
}
