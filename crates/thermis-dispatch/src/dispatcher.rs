// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dispatcher: routes jobs to per-device queues and aggregates fan-out.
//
// Queues are created lazily on the first job for a device identity and live
// until shutdown.  Jobs for different identities run in parallel; jobs for
// one identity are serialized by that identity's queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, instrument, warn};

use thermis_core::config::DispatchConfig;
use thermis_core::error::{Result, ThermisError};
use thermis_core::types::{
    DeviceIdentity, DeviceRef, Operation, PrintResult, PrinterTarget, ReceiptImage,
};

use crate::backend::Backends;
use crate::job::{Job, JobTicket};
use crate::queue::{DeviceQueue, QueueState, SHUTDOWN_MESSAGE};

struct Queues {
    by_device: HashMap<DeviceIdentity, Arc<DeviceQueue>>,
    closed: bool,
}

/// Entry point for all print, drawer, cut, and probe requests.
pub struct Dispatcher {
    config: Arc<DispatchConfig>,
    backends: Arc<Backends>,
    queues: Mutex<Queues>,
}

impl Dispatcher {
    /// Validate `config` and build a dispatcher with no queues yet.
    pub fn new(config: DispatchConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        info!(?backends, "dispatcher ready");
        Ok(Self {
            config: Arc::new(config),
            backends: Arc::new(backends),
            queues: Mutex::new(Queues {
                by_device: HashMap::new(),
                closed: false,
            }),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit `operation` to every device of `target` and wait for all of
    /// them.
    ///
    /// Succeeds if any device succeeded; otherwise returns the failure of the
    /// first device in target order.  Contract violations are returned as
    /// errors before any job is created.
    #[instrument(skip(self, operation, target), fields(op = %operation.kind(), family = target.family.tag()))]
    pub async fn submit(&self, operation: Operation, target: &PrinterTarget) -> Result<PrintResult> {
        let devices = self.resolve(target)?;
        let tickets = self.enqueue_all(&operation, devices)?;

        let mut any_success = false;
        let mut first_failure = None;
        for ticket in tickets {
            let result = ticket.wait().await;
            if result.is_success() {
                any_success = true;
            } else if first_failure.is_none() {
                first_failure = Some(result);
            }
        }

        Ok(match first_failure {
            Some(failure) if !any_success => failure,
            _ => PrintResult::Success,
        })
    }

    /// Render `document` and print it on every device of `target`.
    ///
    /// A document the renderer rejects becomes a terminal failure rather
    /// than an error; nothing is queued for it.
    #[instrument(skip(self, document, target), fields(family = target.family.tag()))]
    pub async fn print_document(
        &self,
        document: &str,
        open_drawer: bool,
        target: &PrinterTarget,
    ) -> Result<PrintResult> {
        self.resolve(target)?;
        let image = match self.render(document) {
            Ok(image) => image,
            Err(ThermisError::Render(e)) => {
                warn!(error = %e, "receipt rendering failed");
                return Ok(PrintResult::terminal(format!("failed to render: {e}")));
            }
            Err(e) => return Err(e),
        };
        self.submit(
            Operation::Print {
                image: Arc::new(image),
                open_drawer,
            },
            target,
        )
        .await
    }

    /// Probe `target`; `true` if any device accepted a connection.
    pub async fn check_connection(&self, target: &PrinterTarget) -> Result<bool> {
        Ok(self.submit(Operation::CheckConnection, target).await?.is_success())
    }

    /// Rasterise a document with the configured renderer.
    pub fn render(&self, document: &str) -> Result<ReceiptImage> {
        let renderer = self
            .backends
            .renderer()
            .ok_or_else(|| ThermisError::Config("no receipt renderer configured".into()))?;
        Ok(renderer.render(document)?)
    }

    /// Jobs waiting across all device queues.
    pub fn pending_count(&self) -> usize {
        self.lock_queues()
            .by_device
            .values()
            .map(|q| q.pending_count())
            .sum()
    }

    /// Jobs waiting per device, keyed by the identity's display form.
    pub fn device_pending_counts(&self) -> BTreeMap<String, usize> {
        self.lock_queues()
            .by_device
            .iter()
            .map(|(identity, q)| (identity.to_string(), q.pending_count()))
            .collect()
    }

    pub fn queue_state(&self, identity: &DeviceIdentity) -> Option<QueueState> {
        self.lock_queues().by_device.get(identity).map(|q| q.state())
    }

    /// Cancel every pending job on every device.  Returns the number removed.
    pub fn clear_all(&self) -> usize {
        let queues = self.snapshot();
        let removed = queues.iter().map(|q| q.clear()).sum();
        info!(removed, "all queues cleared");
        removed
    }

    /// Cancel every pending job for one device.  Unknown devices are a no-op.
    pub fn clear_device(&self, identity: &DeviceIdentity) -> usize {
        let queue = self.lock_queues().by_device.get(identity).cloned();
        queue.map_or(0, |q| q.clear())
    }

    /// Stop accepting work, settle pending jobs, and wait for every queue
    /// loop to finish its in-flight job.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<DeviceQueue>> = {
            let mut guard = self.lock_queues();
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.by_device.drain().map(|(_, q)| q).collect()
        };
        info!(queues = queues.len(), "dispatcher shutting down");
        for queue in queues {
            queue.shutdown().await;
        }
        info!("dispatcher stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock_queues().closed
    }

    fn snapshot(&self) -> Vec<Arc<DeviceQueue>> {
        self.lock_queues().by_device.values().cloned().collect()
    }

    /// Check a target against the contract and expand it to devices.
    fn resolve(&self, target: &PrinterTarget) -> Result<Vec<DeviceRef>> {
        if self.is_shut_down() {
            return Err(ThermisError::DispatcherShutdown);
        }
        if !self.backends.serves(target.family) {
            return Err(ThermisError::InvalidTarget(format!(
                "no driver registered for {}",
                target.family.tag()
            )));
        }
        target.device_refs()
    }

    /// Create one job per device and hand each to its queue, creating queues
    /// as needed.  All jobs are queued before any is awaited.
    fn enqueue_all(&self, operation: &Operation, devices: Vec<DeviceRef>) -> Result<Vec<JobTicket>> {
        let mut tickets = Vec::with_capacity(devices.len());
        for device in devices {
            let queue = self.queue_for(&device.identity)?;
            let (job, ticket) = Job::new(operation.clone(), device, self.config.max_retries);
            if let Err(job) = queue.enqueue(job) {
                // Lost a race with shutdown.
                job.settle(PrintResult::terminal(SHUTDOWN_MESSAGE));
            }
            tickets.push(ticket);
        }
        Ok(tickets)
    }

    fn queue_for(&self, identity: &DeviceIdentity) -> Result<Arc<DeviceQueue>> {
        let mut guard = self.lock_queues();
        if guard.closed {
            return Err(ThermisError::DispatcherShutdown);
        }
        let queue = guard.by_device.entry(identity.clone()).or_insert_with(|| {
            Arc::new(DeviceQueue::spawn(
                identity.clone(),
                Arc::clone(&self.backends),
                Arc::clone(&self.config),
            ))
        });
        Ok(Arc::clone(queue))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock_queues();
        f.debug_struct("Dispatcher")
            .field("backends", &self.backends)
            .field("queues", &guard.by_device.len())
            .field("closed", &guard.closed)
            .finish()
    }
}
