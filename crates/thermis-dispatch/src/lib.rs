// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thermis Dispatch — per-device job queues with retry and failure
// classification.  Jobs for one device run strictly one at a time with a
// settle delay between them; different devices run in parallel.

pub mod api;
pub mod backend;
pub mod classify;
pub mod discovery;
pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod retry;

pub use api::{Command, CommandSurface};
pub use backend::{Backends, FamilyBackend};
pub use classify::classify;
pub use discovery::DiscoverySession;
pub use dispatcher::Dispatcher;
pub use job::{Job, JobTicket};
pub use queue::{DeviceQueue, QueueState};
pub use retry::{RetryDecision, RetryPolicy};
