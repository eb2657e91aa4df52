// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// End-to-end dispatch scenarios against the simulated printer, run on
// paused virtual time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use thermis_bridge::sim::{Invocation, SimulatedFault, SimulatedPrinter, SimulatedRenderer};
use thermis_core::config::DispatchConfig;
use thermis_core::error::DeviceError;
use thermis_core::types::{
    DeviceIdentity, FailureReason, Operation, OperationKind, PrintResult, PrinterFamily,
    PrinterTarget,
};
use thermis_dispatch::{Backends, Dispatcher, QueueState};

const SETTLE: Duration = Duration::from_millis(500);

fn dispatcher(printer: &SimulatedPrinter) -> Arc<Dispatcher> {
    let backends = Backends::new()
        .with_family(
            PrinterFamily::UsbGeneric,
            Arc::new(printer.clone()),
            Arc::new(printer.clone()),
        )
        .with_family(
            PrinterFamily::StarLan,
            Arc::new(printer.clone()),
            Arc::new(printer.clone()),
        )
        .with_renderer(Arc::new(SimulatedRenderer));
    let config = DispatchConfig {
        retry_jitter_ms: 0,
        ..Default::default()
    };
    Arc::new(Dispatcher::new(config, backends).expect("valid config"))
}

fn lan(addr: &str) -> DeviceIdentity {
    DeviceIdentity::Lan(addr.into())
}

fn assert_no_overlap(calls: &[Invocation]) {
    for pair in calls.windows(2) {
        assert!(
            pair[1].started >= pair[0].finished,
            "driver invocations overlap: {:?} then {:?}",
            pair[0],
            pair[1]
        );
    }
}

fn expect_failure(result: PrintResult) -> (FailureReason, bool, String) {
    match result {
        PrintResult::Failed {
            reason,
            retryable,
            message,
        } => (reason, retryable, message.unwrap_or_default()),
        PrintResult::Success => panic!("expected a failure, got success"),
    }
}

#[tokio::test(start_paused = true)]
async fn three_prints_to_one_lan_device_run_sequentially_with_settle_delay() {
    let printer = SimulatedPrinter::new(Duration::from_millis(200));
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.20"]);

    let (a, b, c) = tokio::join!(
        d.print_document("Espresso 2.80", false, &target),
        d.print_document("Latte 3.40", false, &target),
        d.print_document("Mocha 3.90", true, &target),
    );
    assert_eq!(a.expect("valid"), PrintResult::Success);
    assert_eq!(b.expect("valid"), PrintResult::Success);
    assert_eq!(c.expect("valid"), PrintResult::Success);

    let calls = printer.invocations_for(&lan("10.0.0.20"));
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.kind == OperationKind::Print && c.succeeded));
    for pair in calls.windows(2) {
        assert!(pair[1].started >= pair[0].finished + SETTLE);
    }
    assert_eq!(d.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn usb_gate_timing_out_every_attempt_exhausts_the_budget() {
    let printer = SimulatedPrinter::new(Duration::from_millis(100));
    printer.fail_always(&DeviceIdentity::Usb, SimulatedFault::GateHang);
    let d = dispatcher(&printer);

    let result = d
        .print_document("Total 12.00", false, &PrinterTarget::usb())
        .await
        .expect("valid target");

    let (reason, retryable, message) = expect_failure(result);
    assert_eq!(reason, FailureReason::TimeoutError);
    assert!(!retryable);
    assert!(message.starts_with("Max retries (3) exceeded"), "message: {message}");
    assert_eq!(printer.acquisitions(&DeviceIdentity::Usb), 4);
    assert!(printer.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_jobs_never_overlap_on_one_device() {
    let printer = SimulatedPrinter::new(Duration::from_millis(150));
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["kitchen.local"]);

    let mut handles = Vec::new();
    for i in 0..6 {
        let d = Arc::clone(&d);
        let target = target.clone();
        let operation = if i % 2 == 0 {
            Operation::CutPaper
        } else {
            Operation::OpenDrawer
        };
        handles.push(tokio::spawn(async move { d.submit(operation, &target).await }));
    }
    for handle in handles {
        assert!(handle.await.expect("join").expect("valid").is_success());
    }

    let calls = printer.invocations_for(&lan("kitchen.local"));
    assert_eq!(calls.len(), 6);
    assert_no_overlap(&calls);
    assert_eq!(printer.max_concurrency(&lan("kitchen.local")), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_device_does_not_delay_another() {
    let printer = SimulatedPrinter::new(Duration::from_millis(100));
    // Slow, but inside the 10s cut timeout.
    printer.set_latency(&lan("10.0.0.1"), Duration::from_secs(8));
    let d = dispatcher(&printer);

    let slow = {
        let d = Arc::clone(&d);
        tokio::spawn(async move { d.submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.1"])).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let fast = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.2"]))
        .await
        .expect("valid");
    assert!(fast.is_success());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(printer.invocations_for(&lan("10.0.0.1")).is_empty(), "slow job still running");
    assert_eq!(d.queue_state(&lan("10.0.0.1")), Some(QueueState::Executing));

    let slow_started = Instant::now();
    assert!(slow.await.expect("join").expect("valid").is_success());
    assert!(slow_started.elapsed() < Duration::from_secs(8));
    assert_eq!(printer.invocations_for(&lan("10.0.0.1")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn always_retryable_failure_runs_max_retries_plus_one_times() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(
        &lan("10.0.0.30"),
        SimulatedFault::Send(DeviceError::BadResponse("printer busy".into())),
    );
    let d = dispatcher(&printer);

    let result = d
        .submit(Operation::OpenDrawer, &PrinterTarget::lan(["10.0.0.30"]))
        .await
        .expect("valid");

    let (reason, retryable, message) = expect_failure(result);
    assert_eq!(reason, FailureReason::PrinterBusy);
    assert!(!retryable);
    assert!(message.contains("Max retries (3) exceeded"));
    assert_eq!(printer.invocations_for(&lan("10.0.0.30")).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_between_attempts() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(
        &lan("10.0.0.31"),
        SimulatedFault::Send(DeviceError::Transport("network unreachable".into())),
    );
    let d = dispatcher(&printer);

    let result = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.31"]))
        .await
        .expect("valid");
    assert_eq!(result.reason(), Some(FailureReason::NetworkError));

    let calls = printer.invocations_for(&lan("10.0.0.31"));
    let gaps: Vec<Duration> = calls.windows(2).map(|p| p[1].started - p[0].finished).collect();
    assert_eq!(
        gaps,
        vec![Duration::from_secs(3), Duration::from_secs(6), Duration::from_secs(12)]
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_error_settles_after_one_attempt() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(
        &lan("10.0.0.32"),
        SimulatedFault::Send(DeviceError::Other("garbled status byte".into())),
    );
    let d = dispatcher(&printer);

    let result = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.32"]))
        .await
        .expect("valid");

    let (reason, retryable, _) = expect_failure(result);
    assert_eq!(reason, FailureReason::UnknownError);
    assert!(!retryable);
    assert_eq!(printer.invocations_for(&lan("10.0.0.32")).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_job_runs_before_a_retry() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    let device = lan("10.0.0.40");
    printer.push_fault(
        &device,
        SimulatedFault::Send(DeviceError::BadResponse("printer busy".into())),
    );
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.40"]);

    let first = {
        let d = Arc::clone(&d);
        let target = target.clone();
        tokio::spawn(async move { d.submit(Operation::CutPaper, &target).await })
    };
    // J1 has failed once and is waiting on its backoff.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(d.pending_count(), 1);

    let second = d.submit(Operation::OpenDrawer, &target).await.expect("valid");
    assert!(second.is_success());
    assert!(first.await.expect("join").expect("valid").is_success());

    let kinds: Vec<OperationKind> = printer.invocations_for(&device).iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![OperationKind::CutPaper, OperationKind::OpenDrawer, OperationKind::CutPaper]
    );
}

#[tokio::test(start_paused = true)]
async fn clearing_a_device_cancels_pending_but_not_in_flight() {
    let printer = SimulatedPrinter::new(Duration::from_secs(1));
    let device = lan("10.0.0.50");
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.50"]);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let d = Arc::clone(&d);
        let target = target.clone();
        handles.push(tokio::spawn(async move { d.submit(Operation::CutPaper, &target).await }));
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(d.device_pending_counts().get("lan:10.0.0.50"), Some(&2));

    assert_eq!(d.clear_device(&device), 2);
    assert_eq!(d.pending_count(), 0);

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("join").expect("valid"));
    }
    let successes = results.iter().filter(|r| r.is_success()).count();
    let cancelled = results
        .iter()
        .filter(|r| **r == PrintResult::terminal("cleared"))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(cancelled, 2);
    assert_eq!(printer.invocations_for(&device).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_all_empties_every_queue() {
    let printer = SimulatedPrinter::new(Duration::from_secs(1));
    let d = dispatcher(&printer);

    let mut handles = Vec::new();
    for addr in ["10.0.0.60", "10.0.0.60", "10.0.0.61", "10.0.0.61"] {
        let d = Arc::clone(&d);
        handles.push(tokio::spawn(async move {
            d.submit(Operation::CutPaper, &PrinterTarget::lan([addr])).await
        }));
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(d.pending_count(), 2);

    assert_eq!(d.clear_all(), 2);
    assert_eq!(d.pending_count(), 0);
    for handle in handles {
        handle.await.expect("join").expect("valid");
    }
}

#[tokio::test(start_paused = true)]
async fn fan_out_succeeds_if_any_device_succeeds() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(
        &lan("10.0.0.70"),
        SimulatedFault::Gate(DeviceError::Other("no route".into())),
    );
    let d = dispatcher(&printer);

    let result = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.70", "10.0.0.71"]))
        .await
        .expect("valid");
    assert!(result.is_success());
    assert!(
        d.check_connection(&PrinterTarget::lan(["10.0.0.70", "10.0.0.71"]))
            .await
            .expect("valid")
    );
}

#[tokio::test(start_paused = true)]
async fn fan_out_reports_first_failure_in_address_order() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(
        &lan("10.0.0.80"),
        SimulatedFault::Send(DeviceError::Other("head fault".into())),
    );
    printer.fail_always(
        &lan("10.0.0.81"),
        SimulatedFault::Open(DeviceError::Other("refused".into())),
    );
    let d = dispatcher(&printer);

    let result = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.80", "10.0.0.81"]))
        .await
        .expect("valid");
    let (reason, _, message) = expect_failure(result);
    assert_eq!(reason, FailureReason::UnknownError);
    assert!(message.contains("head fault"), "message: {message}");
}

#[tokio::test(start_paused = true)]
async fn duplicate_addresses_share_one_queue() {
    let printer = SimulatedPrinter::new(Duration::from_millis(100));
    let d = dispatcher(&printer);

    let result = d
        .submit(
            Operation::CutPaper,
            &PrinterTarget::lan(["00:11:62:AA:BB:CC", "00-11-62-aa-bb-cc"]),
        )
        .await
        .expect("valid");
    assert!(result.is_success());

    let calls = printer.invocations_for(&lan("00:11:62:AA:BB:CC"));
    assert_eq!(calls.len(), 2);
    assert_no_overlap(&calls);
    assert_eq!(d.device_pending_counts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn probe_reaches_gate_but_not_the_print_head() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    let d = dispatcher(&printer);

    assert!(d.check_connection(&PrinterTarget::usb()).await.expect("valid"));
    assert_eq!(printer.acquisitions(&DeviceIdentity::Usb), 1);
    assert!(printer.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_settles_pending_jobs() {
    let printer = SimulatedPrinter::new(Duration::from_secs(2));
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.90"]);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let d = Arc::clone(&d);
        let target = target.clone();
        handles.push(tokio::spawn(async move { d.submit(Operation::CutPaper, &target).await }));
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    d.shutdown().await;
    assert!(d.is_shut_down());

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("join").expect("valid"));
    }
    assert!(results.contains(&PrintResult::Success));
    assert!(results.contains(&PrintResult::terminal("dispatcher shut down")));
}

#[tokio::test(start_paused = true)]
async fn hung_send_times_out_and_exhausts_the_budget() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    printer.fail_always(&lan("10.0.0.100"), SimulatedFault::SendHang);
    let d = dispatcher(&printer);

    let started = Instant::now();
    let result = d
        .submit(Operation::CutPaper, &PrinterTarget::lan(["10.0.0.100"]))
        .await
        .expect("valid");

    let (reason, retryable, message) = expect_failure(result);
    assert_eq!(reason, FailureReason::TimeoutError);
    assert!(!retryable);
    assert!(message.starts_with("Max retries (3) exceeded"), "message: {message}");
    assert!(message.contains("timed out"), "message: {message}");
    // Four 10s cut timeouts plus 3s, 6s and 12s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(61));
    assert_eq!(printer.acquisitions(&lan("10.0.0.100")), 4);
    assert!(printer.invocations_for(&lan("10.0.0.100")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_send_does_not_stall_the_next_job() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    let device = lan("10.0.0.101");
    printer.push_fault(&device, SimulatedFault::SendHang);
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.101"]);

    let started = Instant::now();
    let first = {
        let d = Arc::clone(&d);
        let target = target.clone();
        tokio::spawn(async move { d.submit(Operation::CutPaper, &target).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let d = Arc::clone(&d);
        let target = target.clone();
        tokio::spawn(async move { d.submit(Operation::OpenDrawer, &target).await })
    };

    assert!(second.await.expect("join").expect("valid").is_success());
    assert!(first.await.expect("join").expect("valid").is_success());

    let calls = printer.invocations_for(&device);
    let kinds: Vec<OperationKind> = calls.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![OperationKind::OpenDrawer, OperationKind::CutPaper]);
    // The drawer waits out the 10s cut timeout; the cut retries after 3s.
    assert!(calls[0].started >= started + Duration::from_secs(10));
    assert!(calls[1].started >= started + Duration::from_secs(13));
    assert_no_overlap(&calls);
}

#[tokio::test(start_paused = true)]
async fn hung_close_is_abandoned_after_the_close_timeout() {
    let printer = SimulatedPrinter::new(Duration::from_millis(50));
    let device = lan("10.0.0.102");
    printer.push_fault(&device, SimulatedFault::CloseHang);
    let d = dispatcher(&printer);
    let target = PrinterTarget::lan(["10.0.0.102"]);

    let first = {
        let d = Arc::clone(&d);
        let target = target.clone();
        tokio::spawn(async move { d.submit(Operation::CutPaper, &target).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = d.submit(Operation::OpenDrawer, &target).await.expect("valid");

    assert!(second.is_success());
    assert!(first.await.expect("join").expect("valid").is_success());

    let calls = printer.invocations_for(&device);
    assert_eq!(calls.len(), 2);
    let close_timeout = DispatchConfig::default().close_timeout();
    assert!(calls[1].started >= calls[0].finished + close_timeout + SETTLE);
}
