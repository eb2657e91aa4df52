// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Caller-facing command surface.
//
// Commands arrive as JSON objects tagged by `"method"` and always resolve to
// a JSON value.  Nothing here returns an error: contract problems become a
// failed print record, `false`, or an `{"error": ...}` object depending on
// the command.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use image::ImageFormat;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use thermis_core::error::{Result, ThermisError};
use thermis_core::types::{
    DeviceIdentity, DiscoveryEvent, Operation, PrintResult, PrinterFamily, PrinterTarget,
    ReceiptImage,
};

use crate::discovery::DiscoverySession;
use crate::dispatcher::Dispatcher;

/// Message returned by `print_receipt` when the document or target is absent.
pub const MISSING_PARAMETERS: &str =
    "Missing required parameters: receiptDTO or printer configuration";

const KNOWN_METHODS: [&str; 11] = [
    "print_receipt",
    "open_cash_drawer",
    "cut_paper",
    "check_printer_connection",
    "get_receipt_preview",
    "get_queue_size",
    "get_device_queue_sizes",
    "clear_print_queue",
    "clear_device_queue",
    "start_discovery",
    "stop_discovery",
];

/// A request from the host application.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Command {
    PrintReceipt {
        #[serde(rename = "receiptDTO")]
        receipt: Option<Value>,
        #[serde(rename = "shouldOpenCashDrawer", default)]
        open_drawer: Option<bool>,
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    },
    OpenCashDrawer {
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    },
    CutPaper {
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    },
    CheckPrinterConnection {
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    },
    GetReceiptPreview {
        receipt_dto_json: Option<Value>,
    },
    GetQueueSize,
    GetDeviceQueueSizes,
    ClearPrintQueue,
    ClearDeviceQueue {
        device_key: Option<String>,
    },
    StartDiscovery,
    StopDiscovery,
}

/// Executes [`Command`]s against a dispatcher.
pub struct CommandSurface {
    dispatcher: Arc<Dispatcher>,
    discovery: Mutex<Option<DiscoverySession>>,
    discovery_sink: Option<mpsc::Sender<DiscoveryEvent>>,
}

impl CommandSurface {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            discovery: Mutex::new(None),
            discovery_sink: None,
        }
    }

    /// Forward discovery events to `sink`.  Without one they are only logged.
    pub fn with_discovery_sink(mut self, sink: mpsc::Sender<DiscoveryEvent>) -> Self {
        self.discovery_sink = Some(sink);
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn lock_discovery(&self) -> MutexGuard<'_, Option<DiscoverySession>> {
        self.discovery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decode and execute a raw request.
    pub async fn handle_json(&self, request: Value) -> Value {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match serde_json::from_value::<Command>(request) {
            Ok(command) => self.handle(command).await,
            Err(e) => match method.as_deref() {
                Some(m) if KNOWN_METHODS.contains(&m) => {
                    warn!(method = m, error = %e, "malformed command parameters");
                    invalid_parameters(m, &e)
                }
                other => {
                    debug!(method = ?other, "unknown command");
                    json!({ "error": "not implemented" })
                }
            },
        }
    }

    pub async fn handle(&self, command: Command) -> Value {
        match command {
            Command::PrintReceipt {
                receipt,
                open_drawer,
                printer_type,
                mac_addresses,
            } => {
                let result = self
                    .print_receipt(receipt, open_drawer.unwrap_or(false), printer_type, mac_addresses)
                    .await;
                response(&result)
            }
            Command::OpenCashDrawer {
                printer_type,
                mac_addresses,
            } => json!(self.run_simple(Operation::OpenDrawer, printer_type, mac_addresses).await),
            Command::CutPaper {
                printer_type,
                mac_addresses,
            } => json!(self.run_simple(Operation::CutPaper, printer_type, mac_addresses).await),
            Command::CheckPrinterConnection {
                printer_type,
                mac_addresses,
            } => json!(
                self.run_simple(Operation::CheckConnection, printer_type, mac_addresses)
                    .await
            ),
            Command::GetReceiptPreview { receipt_dto_json } => self.preview(receipt_dto_json),
            Command::GetQueueSize => json!(self.dispatcher.pending_count()),
            Command::GetDeviceQueueSizes => json!(self.dispatcher.device_pending_counts()),
            Command::ClearPrintQueue => {
                self.dispatcher.clear_all();
                json!(true)
            }
            Command::ClearDeviceQueue { device_key } => {
                let identity = device_key.as_deref().and_then(DeviceIdentity::parse_key);
                match identity {
                    Some(identity) => {
                        self.dispatcher.clear_device(&identity);
                        json!(true)
                    }
                    None => {
                        warn!(key = ?device_key, "clear_device_queue without a usable device key");
                        json!(false)
                    }
                }
            }
            Command::StartDiscovery => json!(self.start_discovery().await),
            Command::StopDiscovery => {
                self.stop_discovery().await;
                Value::Null
            }
        }
    }

    async fn print_receipt(
        &self,
        receipt: Option<Value>,
        open_drawer: bool,
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    ) -> PrintResult {
        let Some(document) = receipt.and_then(document_text) else {
            return PrintResult::terminal(MISSING_PARAMETERS);
        };
        let target = match parse_target(printer_type.as_deref(), mac_addresses) {
            Ok(target) => target,
            Err(ThermisError::MissingParameter(_)) => return PrintResult::terminal(MISSING_PARAMETERS),
            Err(e) => return PrintResult::terminal(e.to_string()),
        };
        match self.dispatcher.print_document(&document, open_drawer, &target).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "print rejected");
                PrintResult::terminal(e.to_string())
            }
        }
    }

    async fn run_simple(
        &self,
        operation: Operation,
        printer_type: Option<String>,
        mac_addresses: Option<Vec<String>>,
    ) -> bool {
        let kind = operation.kind();
        let target = match parse_target(printer_type.as_deref(), mac_addresses) {
            Ok(target) => target,
            Err(e) => {
                warn!(op = %kind, error = %e, "rejected command");
                return false;
            }
        };
        match self.dispatcher.submit(operation, &target).await {
            Ok(result) => result.is_success(),
            Err(e) => {
                warn!(op = %kind, error = %e, "rejected command");
                false
            }
        }
    }

    fn preview(&self, receipt: Option<Value>) -> Value {
        let Some(document) = receipt.and_then(document_text) else {
            return json!({ "error": "missing receipt_dto_json" });
        };
        let encoded = self
            .dispatcher
            .render(&document)
            .and_then(|image| encode_preview(&image));
        match encoded {
            Ok(preview) => preview,
            Err(e) => {
                warn!(error = %e, "receipt preview failed");
                json!({ "error": e.to_string() })
            }
        }
    }

    /// Start a discovery window, replacing any window still running.
    async fn start_discovery(&self) -> bool {
        let Some(notifier) = self.dispatcher.backends().notifier().cloned() else {
            warn!("discovery requested but no notifier is configured");
            return false;
        };
        self.stop_discovery().await;

        let window = self.dispatcher.config().discovery_window();
        let (session, mut events) = DiscoverySession::start(notifier, window);
        let sink = self.discovery_sink.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &sink {
                    Some(sink) => {
                        if sink.send(event).await.is_err() {
                            debug!("discovery sink closed");
                            break;
                        }
                    }
                    None => debug!(?event, "discovery event"),
                }
            }
        });

        *self.lock_discovery() = Some(session);
        info!("discovery window opened");
        true
    }

    async fn stop_discovery(&self) {
        let session = self.lock_discovery().take();
        if let Some(session) = session {
            session.stop().await;
        }
    }
}

/// Build a target from the surface's parameter spelling.
pub fn parse_target(printer_type: Option<&str>, addresses: Option<Vec<String>>) -> Result<PrinterTarget> {
    let tag = printer_type.ok_or_else(|| ThermisError::MissingParameter("printer_type".into()))?;
    let family = PrinterFamily::from_tag(tag)
        .ok_or_else(|| ThermisError::InvalidTarget(format!("unknown printer type {tag:?}")))?;
    Ok(match family {
        PrinterFamily::UsbGeneric => PrinterTarget::usb(),
        PrinterFamily::StarLan => {
            let addresses = addresses.ok_or_else(|| ThermisError::MissingParameter("mac_addresses".into()))?;
            PrinterTarget::lan(addresses)
        }
    })
}

/// The document a receipt parameter carries: a string as-is, anything else
/// as its JSON text.  `null` and blank strings count as absent.
fn document_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn encode_preview(image: &ReceiptImage) -> Result<Value> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ThermisError::Config(format!("PNG encoding failed: {e}")))?;
    Ok(json!({
        "width": image.width(),
        "height": image.height(),
        "png": png,
    }))
}

fn response(result: &PrintResult) -> Value {
    serde_json::to_value(result.to_response())
        .unwrap_or_else(|e| json!({ "error": format!("unserializable result: {e}") }))
}

fn invalid_parameters(method: &str, err: &serde_json::Error) -> Value {
    match method {
        "print_receipt" => response(&PrintResult::terminal(MISSING_PARAMETERS)),
        "open_cash_drawer" | "cut_paper" | "check_printer_connection" | "clear_device_queue" => {
            json!(false)
        }
        _ => json!({ "error": format!("invalid parameters: {err}") }),
    }
}
