// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Discovery sessions.
//
// A session runs one notifier window and turns its output into a stream of
// `DiscoveryEvent`s.  Every session ends with exactly one `Finished`, whether
// the window elapsed, the notifier failed, or the session was stopped early.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use thermis_bridge::traits::DiscoveryNotifier;
use thermis_core::types::DiscoveryEvent;

/// Slack allowed past the window before a silent notifier is abandoned.
const WINDOW_GRACE: Duration = Duration::from_secs(2);

const EVENT_BUFFER: usize = 32;

/// Handle on a running discovery window.
#[derive(Debug)]
pub struct DiscoverySession {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DiscoverySession {
    /// Start a window of `window` length.  Events arrive on the returned
    /// receiver, the last one always being `Finished`.
    pub fn start(
        notifier: Arc<dyn DiscoveryNotifier>,
        window: Duration,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(drive(notifier, window, events_tx, stop_rx));
        (
            Self {
                stop: Some(stop_tx),
                task,
            },
            events_rx,
        )
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// End the window early and wait for the final `Finished`.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "discovery task ended abnormally");
        }
    }
}

async fn drive(
    notifier: Arc<dyn DiscoveryNotifier>,
    window: Duration,
    events: mpsc::Sender<DiscoveryEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let (found_tx, mut found_rx) = mpsc::channel(EVENT_BUFFER);
    let run = notifier.discover(window, found_tx);
    tokio::pin!(run);
    let overrun = tokio::time::sleep(window + WINDOW_GRACE);
    tokio::pin!(overrun);

    let mut notifier_done = false;
    let mut found = 0usize;
    info!(window_ms = window.as_millis() as u64, "discovery started");

    loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("discovery stopped early");
                break;
            }
            _ = &mut overrun => {
                warn!("discovery notifier overran its window");
                break;
            }
            result = &mut run, if !notifier_done => {
                notifier_done = true;
                if let Err(e) = result {
                    warn!(error = %e, "discovery failed");
                    let _ = events.send(DiscoveryEvent::Failed { message: e.to_string() }).await;
                }
            }
            device = found_rx.recv() => match device {
                Some(device) => {
                    found += 1;
                    if events.send(DiscoveryEvent::DeviceFound(device)).await.is_err() {
                        debug!("discovery listener gone");
                        break;
                    }
                }
                // The notifier has returned and everything it sent is drained.
                None => break,
            },
        }
    }

    info!(found, "discovery finished");
    let _ = events.send(DiscoveryEvent::Finished).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use thermis_core::error::{Result, ThermisError};
    use thermis_core::types::DiscoveredDevice;

    struct Scripted {
        devices: Vec<DiscoveredDevice>,
        fail: bool,
    }

    #[async_trait]
    impl DiscoveryNotifier for Scripted {
        async fn discover(&self, window: Duration, found: mpsc::Sender<DiscoveredDevice>) -> Result<()> {
            for device in &self.devices {
                let _ = found.send(device.clone()).await;
            }
            if self.fail {
                return Err(ThermisError::Discovery("wifi is off".into()));
            }
            tokio::time::sleep(window).await;
            Ok(())
        }
    }

    fn device(mac: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            device_name: Some("TSP143".into()),
            address: "10.0.0.2:9100".into(),
            identity: mac.into(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn window_ends_with_single_finished() {
        let notifier = Arc::new(Scripted {
            devices: vec![device("AA"), device("BB")],
            fail: false,
        });
        let (_session, rx) = DiscoverySession::start(notifier, Duration::from_secs(10));
        let events = collect(rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], DiscoveryEvent::DeviceFound(_)));
        assert_eq!(events[2], DiscoveryEvent::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_before_finished() {
        let notifier = Arc::new(Scripted {
            devices: vec![],
            fail: true,
        });
        let (_session, rx) = DiscoverySession::start(notifier, Duration::from_secs(10));
        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DiscoveryEvent::Failed { message } if message.contains("wifi")));
        assert_eq!(events[1], DiscoveryEvent::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn early_stop_still_finishes_once() {
        let notifier = Arc::new(Scripted {
            devices: vec![device("AA")],
            fail: false,
        });
        let (session, mut rx) = DiscoverySession::start(notifier, Duration::from_secs(10));
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::DeviceFound(_))));
        session.stop().await;
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Finished));
        assert_eq!(rx.recv().await, None);
    }
}
