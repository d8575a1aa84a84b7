//! Report worker boundary.
//!
//! A request carries its own snapshot and selection; the worker answers with
//! exactly one response and keeps nothing between requests. Faults inside a
//! report are caught here and come back as a structured failure instead of
//! taking the worker thread down.

use crate::reports::{
    generate_monthly_summary, generate_section_report, generate_statistics, generate_top10_report,
};
use crate::types::{
    Filters, RecordId, ReportKind, SectionReport, Snapshot, StatisticsReport, SummaryReport,
    Top10Report,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Once;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub report_kind: ReportKind,
    pub snapshot: Snapshot,
    /// Ids to aggregate. When omitted, every id in `snapshot.all_ids`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<RecordId>>,
    /// Only meaningful for the top10 report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

impl Request {
    pub fn new(report_kind: ReportKind, snapshot: Snapshot) -> Self {
        Self {
            report_kind,
            snapshot,
            selection: None,
            filters: None,
        }
    }

    pub fn with_selection(mut self, selection: Vec<RecordId>) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn selection(&self) -> &[RecordId] {
        self.selection
            .as_deref()
            .unwrap_or(self.snapshot.all_ids.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportResult {
    Top10(Top10Report),
    Summary(SummaryReport),
    Sections(SectionReport),
    Statistics(StatisticsReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The request could not be decoded (malformed snapshot shape, unknown
    /// report kind).
    InvalidRequest,
    /// A report panicked while running.
    Panic,
}

/// Wire response. Success carries `reportKind` and `result`; failure
/// carries `kind`, `error` and optionally `trace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_kind: Option<ReportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReportResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl Response {
    pub fn success(report_kind: ReportKind, result: ReportResult) -> Self {
        Self {
            success: true,
            report_kind: Some(report_kind),
            result: Some(result),
            kind: None,
            error: None,
            trace: None,
        }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>, trace: Option<String>) -> Self {
        Self {
            success: false,
            report_kind: None,
            result: None,
            kind: Some(kind),
            error: Some(error.into()),
            trace,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn report worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("report worker is not running")]
    Disconnected,

    #[error("report worker stopped before answering")]
    NoResponse,
}

/// Run the report a request asks for. Pure; may panic on internal bugs,
/// which [`handle_request`] turns into a failure response.
pub fn run_report(request: &Request) -> ReportResult {
    let selection = request.selection();
    match request.report_kind {
        ReportKind::Top10 => {
            let filters = request.filters.clone().unwrap_or_default();
            ReportResult::Top10(generate_top10_report(&request.snapshot, selection, &filters))
        }
        ReportKind::Summary => {
            ReportResult::Summary(generate_monthly_summary(&request.snapshot, selection))
        }
        ReportKind::Sections => {
            ReportResult::Sections(generate_section_report(&request.snapshot, selection))
        }
        ReportKind::Statistics => {
            ReportResult::Statistics(generate_statistics(&request.snapshot, selection))
        }
    }
}

pub fn handle_request(request: Request) -> Response {
    let kind = request.report_kind;
    info!(
        report = %kind,
        records = request.snapshot.len(),
        selected = request.selection().len(),
        "processing report request"
    );
    guarded(kind, || run_report(&request))
}

/// Decode a JSON request, run it and encode the response.
pub fn handle_message(raw: &str) -> String {
    let response = match decode_request(raw) {
        Ok(request) => handle_request(request),
        Err(rejected) => rejected,
    };
    encode_response(&response)
}

/// Decode a JSON request; a malformed one becomes its failure response.
pub fn decode_request(raw: &str) -> Result<Request, Response> {
    serde_json::from_str::<Request>(raw).map_err(|e| {
        warn!(error = %e, "rejected malformed request");
        Response::failure(
            FailureKind::InvalidRequest,
            e.to_string(),
            Some(format!("line {} column {}", e.line(), e.column())),
        )
    })
}

pub fn encode_response(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        serde_json::json!({ "success": false, "kind": "panic", "error": e.to_string() }).to_string()
    })
}

fn guarded<F>(kind: ReportKind, run: F) -> Response
where
    F: FnOnce() -> ReportResult,
{
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => Response::success(kind, result),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(report = %kind, error = %message, "report failed");
            Response::failure(
                FailureKind::Panic,
                format!("{kind} report failed: {message}"),
                take_panic_trace(),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Route panics through `tracing` and remember where they happened so the
/// worker boundary can attach a trace to the failure response. The hook
/// that was installed before still runs afterwards.
///
/// Backtraces are included when `RUST_BACKTRACE` enables them.
pub fn install_panic_trace_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(chain_panic_trace_hook);
}

fn chain_panic_trace_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let backtrace = Backtrace::capture();
        let trace = match backtrace.status() {
            BacktraceStatus::Captured => format!("panicked at {location}\n{backtrace}"),
            _ => format!("panicked at {location}"),
        };
        error!(
            %location,
            message = %panic_message(info.payload()),
            "panic"
        );
        LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
        previous(info);
    }));
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

type Job = (Request, mpsc::Sender<Response>);

/// Handle to a dedicated report thread. Requests are processed one at a
/// time in submission order. Dropping the handle stops the thread.
pub struct Worker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn() -> Result<Self, WorkerError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("report-worker".to_string())
            .spawn(move || {
                for (request, reply) in receiver {
                    let response = handle_request(request);
                    if reply.send(response).is_err() {
                        debug!("requester hung up before the response was ready");
                    }
                }
                debug!("report worker shutting down");
            })
            .map_err(WorkerError::Spawn)?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Send one request and block until its response arrives.
    pub fn submit(&self, request: Request) -> Result<Response, WorkerError> {
        let sender = self.sender.as_ref().ok_or(WorkerError::Disconnected)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        sender
            .send((request, reply_tx))
            .map_err(|_| WorkerError::Disconnected)?;
        reply_rx.recv().map_err(|_| WorkerError::NoResponse)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("report worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn snapshot_json() -> Value {
        json!({
            "recordsById": {
                "1": {"Tipo de reporte": "Fuga de agua", "Estado Reporte": "Pendiente", "Fecha reporte": "2024-03-15", "transi": "AA"},
                "2": {"Tipo de reporte": "Bache", "Estado Reporte": "Atendido", "Fecha reporte": "2024-02-01"},
                "3": {"Tipo de reporte": "Bache"}
            },
            "allIds": ["1", "2", "3"]
        })
    }

    fn snapshot() -> Snapshot {
        serde_json::from_value(snapshot_json()).unwrap()
    }

    #[test]
    fn top10_message_round_trip() {
        let raw = json!({
            "reportKind": "top10",
            "snapshot": snapshot_json(),
            "selection": [1],
            "filters": {"typeFilter": "Fuga de agua"}
        })
        .to_string();
        let v: Value = serde_json::from_str(&handle_message(&raw)).unwrap();

        assert_eq!(v["success"], true);
        assert_eq!(v["reportKind"], "top10");
        assert_eq!(v["result"]["top10"], json!([{"type": "Fuga de agua", "total": 1}]));
        assert_eq!(v["result"]["months"], json!([{"key": "2024-03", "label": "Marzo"}]));
        assert_eq!(v["result"]["byType"]["Fuga de agua"]["2024-03"]["Pendiente"], 1);
        assert_eq!(v["result"]["filters"]["typeFilter"], "Fuga de agua");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn omitted_selection_uses_all_ids() {
        let response = handle_request(Request::new(ReportKind::Summary, snapshot()));
        let Some(ReportResult::Summary(summary)) = response.result else {
            panic!("expected a summary result");
        };
        let months: Vec<&str> = summary.sorted_months.iter().map(|m| m.as_str()).collect();
        assert_eq!(months, vec!["2024-02", "2024-03"]);
    }

    #[test]
    fn sections_message() {
        let raw = json!({"reportKind": "sections", "snapshot": snapshot_json(), "selection": ["1", "2", "3"]})
            .to_string();
        let v: Value = serde_json::from_str(&handle_message(&raw)).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["result"]["sortedSections"], json!(["AA", "Sin sección"]));
    }

    #[test]
    fn malformed_snapshot_is_a_structured_failure() {
        let raw = json!({"reportKind": "summary", "snapshot": {"recordsById": [1, 2]}}).to_string();
        let v: Value = serde_json::from_str(&handle_message(&raw)).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["kind"], "invalid_request");
        assert!(v["error"].as_str().unwrap().contains("invalid type"));
        assert!(v["trace"].as_str().unwrap().starts_with("line 1"));
        assert!(v.get("result").is_none());
    }

    #[test]
    fn unknown_report_kind_is_rejected() {
        let raw = json!({"reportKind": "heatmap", "snapshot": snapshot_json()}).to_string();
        let v: Value = serde_json::from_str(&handle_message(&raw)).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["kind"], "invalid_request");
    }

    #[test]
    fn not_json_at_all() {
        let v: Value = serde_json::from_str(&handle_message("{{nope")).unwrap();
        assert_eq!(v["success"], false);
    }

    // Tests that swap or depend on the process-wide panic hook.
    static HOOK_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn panics_become_failure_responses() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        install_panic_trace_hook();
        let response = guarded(ReportKind::Sections, || panic!("snapshot exploded"));
        assert!(!response.success);
        assert_eq!(response.kind, Some(FailureKind::Panic));
        assert_eq!(
            response.error.as_deref(),
            Some("sections report failed: snapshot exploded")
        );
        assert!(response.trace.unwrap().contains("worker.rs"));
        assert!(response.result.is_none());
    }

    #[test]
    fn worker_thread_answers_requests_in_order() {
        let worker = Worker::spawn().unwrap();
        let first = worker
            .submit(Request::new(ReportKind::Top10, snapshot()).with_selection(vec!["2".into()]))
            .unwrap();
        let second = worker
            .submit(Request::new(ReportKind::Top10, snapshot()))
            .unwrap();

        let (Some(ReportResult::Top10(a)), Some(ReportResult::Top10(b))) =
            (first.result, second.result)
        else {
            panic!("expected top10 results");
        };
        assert!(a.top10.is_empty());
        assert_eq!(b.top10.len(), 1);
    }

    #[test]
    fn worker_keeps_no_state_between_requests() {
        let worker = Worker::spawn().unwrap();
        let full = worker
            .submit(Request::new(ReportKind::Summary, snapshot()))
            .unwrap();
        let empty = worker
            .submit(Request::new(ReportKind::Summary, Snapshot::default()))
            .unwrap();
        assert!(full.success && empty.success);
        assert_eq!(
            empty.result,
            Some(ReportResult::Summary(SummaryReport::default()))
        );
    }

    #[test]
    fn response_decodes_back() {
        let raw = handle_message(
            &json!({"reportKind": "summary", "snapshot": snapshot_json()}).to_string(),
        );
        let response: Response = serde_json::from_str(&raw).unwrap();
        assert!(response.success);
        assert_eq!(response.report_kind, Some(ReportKind::Summary));
        assert!(matches!(response.result, Some(ReportResult::Summary(_))));
    }

    #[test]
    fn trace_hook_keeps_the_previous_hook() {
        let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original = panic::take_hook();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        panic::set_hook(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        chain_panic_trace_hook();

        let response = guarded(ReportKind::Summary, || panic!("bad month"));

        // Drops the chained hook before putting the original one back.
        drop(panic::take_hook());
        panic::set_hook(original);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.kind, Some(FailureKind::Panic));
        assert!(response.trace.unwrap().contains("worker.rs"));
    }

    #[test]
    fn statistics_message() {
        let raw = json!({"reportKind": "statistics", "snapshot": snapshot_json()}).to_string();
        let v: Value = serde_json::from_str(&handle_message(&raw)).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["reportKind"], "statistics");
        assert_eq!(v["result"]["global"]["total"], 3);
        assert_eq!(v["result"]["global"]["tipo"]["Bache"], 2);
        assert_eq!(v["result"]["global"]["mes"]["sin_mes"], 1);
        assert_eq!(v["result"]["values"]["estado"], json!(["Atendido", "Pendiente", "Sin estado"]));

        let response: Response = serde_json::from_str(&handle_message(&raw)).unwrap();
        assert!(matches!(response.result, Some(ReportResult::Statistics(_))));
    }
}
