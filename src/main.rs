// Entry point and high-level CLI flow.
//
// Two ways in:
// - `--input FILE` loads a snapshot (snapshot JSON or GeoJSON export),
//   builds the selection from the filters, runs the requested reports on
//   the worker thread and writes JSON/CSV plus console previews.
// - `--serve` answers one JSON request per stdin line with one JSON
//   response per stdout line.
// - `--check-assets DIR` runs the offline cache lifecycle against a built
//   site directory.
mod asset_cache;
mod cli;
mod config;
mod loader;
mod output;
mod reports;
mod selection;
mod types;
mod util;
mod worker;

use anyhow::{bail, Context, Result};
use asset_cache::{AssetCache, FetchStrategy, SiteDir, CACHE_GENERATION, PRECACHE_ASSETS};
use cli::Args;
use config::{Config, DEFAULT_CONFIG_FILE};
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use chrono::Utc;
use loader::LoadReport;
use types::{
    Filters, ReportKind, SectionReport, Snapshot, StatisticsReport, SummaryReport, Top10Report,
};
use worker::{ReportResult, Request, Response, Worker};

fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config();
    }

    let mut config = Config::resolve(args.config.as_deref())?;
    config.merge_with_args(&args);

    init_logging(&args, &config);
    worker::install_panic_trace_hook();
    info!("geoportal_reports v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    let outcome = if args.serve {
        serve()
    } else if let Some(ref site) = args.check_assets {
        check_assets(site)
    } else {
        generate_reports(&args, &config)
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit it manually.", DEFAULT_CONFIG_FILE);
        std::process::exit(1);
    }
    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;
    println!("Created {} with default settings.", DEFAULT_CONFIG_FILE);
    Ok(())
}

/// Logs go to stderr so `--serve` keeps stdout for responses.
fn init_logging(args: &Args, config: &Config) {
    let level = if !args.quiet && config.logging.verbose {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: a tracing subscriber was already installed");
    }
}

fn serve() -> Result<()> {
    let worker = Worker::spawn()?;
    let answered = serve_lines(&worker, io::stdin().lock(), io::stdout().lock())?;
    info!(answered, "stdin closed, stopping");
    Ok(())
}

/// One response line per non-blank request line. Malformed requests get
/// a failure response and the loop goes on.
fn serve_lines<R: BufRead, W: Write>(worker: &Worker, input: R, mut output: W) -> Result<usize> {
    let mut answered = 0usize;
    for line in input.lines() {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match worker::decode_request(&line) {
            Ok(request) => worker.submit(request)?,
            Err(rejected) => rejected,
        };
        writeln!(output, "{}", worker::encode_response(&response))?;
        output.flush()?;
        answered += 1;
    }
    Ok(answered)
}

fn check_assets(site: &Path) -> Result<()> {
    let mut network = SiteDir::new(site);
    let mut cache = AssetCache::new(CACHE_GENERATION);
    cache
        .install(&mut network)
        .with_context(|| format!("Site {} cannot be precached", site.display()))?;
    let dropped = cache.activate();
    debug!(?dropped, "activation done");

    println!("Asset cache {} ready", cache.generation());
    for path in PRECACHE_ASSETS.iter().copied().chain(["./index.html"]) {
        let strategy = match FetchStrategy::for_path(path) {
            FetchStrategy::NetworkFirst => "network-first",
            FetchStrategy::CacheFirst => "cache-first",
        };
        match cache.fetch(path, &mut network) {
            Ok(asset) => println!(
                "  {:<24} {:<14} {} bytes",
                path,
                strategy,
                util::format_int(asset.body.len())
            ),
            Err(e) => println!("  {:<24} {:<14} {}", path, strategy, e),
        }
    }
    println!(
        "Generations kept: {} (clients claimed: {})",
        cache.generations().join(", "),
        cache.clients_claimed()
    );
    Ok(())
}

fn generate_reports(args: &Args, config: &Config) -> Result<()> {
    let input = args.input.as_deref().context("--input is required")?;
    let (snapshot, load_report) = loader::load_snapshot(input)?;

    println!(
        "Processing dataset... ({} reports loaded from {} rows)",
        util::format_int(load_report.loaded_rows),
        util::format_int(load_report.total_rows)
    );
    if load_report.missing_properties > 0 {
        println!(
            "Note: {} rows skipped without properties.",
            util::format_int(load_report.missing_properties)
        );
    }
    if load_report.duplicate_ids > 0 {
        println!(
            "Note: {} rows skipped with a duplicate id.",
            util::format_int(load_report.duplicate_ids)
        );
    }
    if load_report.missing_coords > 0 {
        println!(
            "Info: {} reports have no valid coordinates.",
            util::format_int(load_report.missing_coords)
        );
    }

    if snapshot.is_empty() {
        warn!(input = %input.display(), "input holds no reports");
    }

    let filters = args.filters();
    let selection = selection::build_selection(&snapshot, &filters);
    if !filters.is_empty() {
        println!(
            "Filters kept {} of {} reports.",
            util::format_int(selection.len()),
            util::format_int(snapshot.len())
        );
    }
    println!();

    std::fs::create_dir_all(&config.output.dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output.dir.display()
        )
    })?;

    let worker = Worker::spawn()?;
    let mut failed = Vec::new();
    for kind in args.report.kinds() {
        let request = build_request(kind, &snapshot, &selection, &filters);
        let response = worker.submit(request)?;
        if let Some(reason) = emit_response(response, config, &load_report)? {
            warn!(report = %kind, %reason, "report failed");
            eprintln!("Report {} failed: {}\n", kind, reason);
            failed.push(kind.to_string());
        }
    }

    if !failed.is_empty() {
        bail!("{} report(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn build_request(
    kind: ReportKind,
    snapshot: &Snapshot,
    selection: &[types::RecordId],
    filters: &Filters,
) -> Request {
    // Each request owns its copy of the snapshot.
    let request = Request::new(kind, snapshot.clone()).with_selection(selection.to_vec());
    if kind == ReportKind::Top10 {
        request.with_filters(filters.clone())
    } else {
        request
    }
}

/// Write out one worker response. Returns the failure reason when the
/// report did not run.
fn emit_response(
    response: Response,
    config: &Config,
    load_report: &LoadReport,
) -> Result<Option<String>> {
    if !response.success {
        return Ok(Some(
            response.error.unwrap_or_else(|| "unknown failure".to_string()),
        ));
    }
    match response.result {
        Some(ReportResult::Top10(report)) => emit_top10(&report, config)?,
        Some(ReportResult::Summary(report)) => emit_summary(&report, config)?,
        Some(ReportResult::Sections(report)) => emit_sections(&report, config)?,
        Some(ReportResult::Statistics(mut report)) => {
            report.meta.generated_at = Some(Utc::now().to_rfc3339());
            report.meta.coords = Some(load_report.coord_stats());
            emit_statistics(&report, config)?
        }
        None => return Ok(Some("no result".to_string())),
    }
    Ok(None)
}

fn emit_top10(report: &Top10Report, config: &Config) -> Result<()> {
    let dir = &config.output.dir;
    let rows = output::top10_rows(report);
    output::write_json(&dir.join("report_top10.json"), report)?;
    if config.output.write_csv {
        output::write_csv(&dir.join("report_top10.csv"), &rows)?;
        output::write_csv(
            &dir.join("report_top10_by_month.csv"),
            &output::type_month_rows(report),
        )?;
    }

    println!("Report 1: Top 10 Report Types by Pending Count");
    println!(
        "(Pendiente {} | En atención {} | otros {})\n",
        util::format_int(report.status_tally.pending),
        util::format_int(report.status_tally.in_progress),
        util::format_int(report.status_tally.other)
    );
    output::preview_table_rows(&rows, config.output.preview_rows);
    println!("(Full report exported to {})\n", dir.join("report_top10.json").display());
    Ok(())
}

fn emit_summary(report: &SummaryReport, config: &Config) -> Result<()> {
    let dir = &config.output.dir;
    let rows = output::summary_rows(report);
    output::write_json(&dir.join("report_summary.json"), report)?;
    if config.output.write_csv {
        output::write_csv(&dir.join("report_summary.csv"), &rows)?;
    }

    println!("Report 2: Monthly Status Summary");
    println!("(Backlog and aging indicator, oldest month first)\n");
    output::preview_table_rows(&rows, config.output.preview_rows);
    println!("(Full report exported to {})\n", dir.join("report_summary.json").display());
    Ok(())
}

fn emit_sections(report: &SectionReport, config: &Config) -> Result<()> {
    let dir = &config.output.dir;
    let rows = output::section_rows(report);
    output::write_json(&dir.join("report_sections.json"), report)?;
    if config.output.write_csv {
        output::write_csv(&dir.join("report_sections.csv"), &rows)?;
    }

    println!("Report 3: Status by Section and Month");
    println!(
        "({} sections over {} months)\n",
        report.sorted_sections.len(),
        report.sorted_months.len()
    );
    output::preview_table_rows(&rows, config.output.preview_rows);
    println!("(Full report exported to {})\n", dir.join("report_sections.json").display());
    Ok(())
}

fn emit_statistics(report: &StatisticsReport, config: &Config) -> Result<()> {
    let dir = &config.output.dir;
    let rows = output::statistics_rows(report);
    output::write_json(&dir.join("estadisticas.json"), report)?;
    if config.output.write_csv {
        output::write_csv(&dir.join("estadisticas.csv"), &rows)?;
    }

    println!("Report 4: Statistics by Section and Colonia");
    println!(
        "({} reports, {} sections, {} colonias)\n",
        util::format_int(report.meta.records),
        util::format_int(report.secciones.len()),
        util::format_int(report.colonias.len())
    );
    output::preview_table_rows(&rows, config.output.preview_rows);
    println!("(Full report exported to {})\n", dir.join("estadisticas.json").display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use crate::worker::FailureKind;

    fn snapshot_json() -> Value {
        json!({
            "recordsById": {
                "1": {"Tipo de reporte": "Bache", "Estado Reporte": "Pendiente", "Fecha reporte": "2024-03-15", "Colonia": "Centro"},
                "2": {"Tipo de reporte": "Poda", "Estado Reporte": "Atendido", "Fecha reporte": "2024-04-02", "seccion": "12"}
            },
            "allIds": ["1", "2"]
        })
    }

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.output.dir = dir.to_path_buf();
        config.output.preview_rows = 2;
        config
    }

    #[test]
    fn serve_answers_each_request_line() {
        let input = [
            json!({"reportKind": "summary", "snapshot": snapshot_json()}).to_string(),
            "   ".to_string(),
            "{{not json".to_string(),
            json!({"reportKind": "top10", "snapshot": snapshot_json(), "selection": ["1"]}).to_string(),
        ]
        .join("\n");

        let worker = Worker::spawn().unwrap();
        let mut out = Vec::new();
        let answered = serve_lines(&worker, Cursor::new(input), &mut out).unwrap();

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(answered, 3);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["reportKind"], "summary");
        assert_eq!(lines[1]["success"], false);
        assert_eq!(lines[1]["kind"], "invalid_request");
        assert_eq!(lines[2]["success"], true);
        assert_eq!(lines[2]["result"]["top10"], json!([{"type": "Bache", "total": 1}]));
    }

    #[test]
    fn serve_with_no_input_writes_nothing() {
        let worker = Worker::spawn().unwrap();
        let mut out = Vec::new();
        assert_eq!(serve_lines(&worker, Cursor::new("\n\n"), &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn successful_responses_are_written_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let snapshot: Snapshot = serde_json::from_value(snapshot_json()).unwrap();
        let load_report = LoadReport {
            total_rows: 3,
            loaded_rows: 2,
            missing_coords: 1,
            ..LoadReport::default()
        };

        for kind in [ReportKind::Summary, ReportKind::Statistics] {
            let response = worker::handle_request(Request::new(kind, snapshot.clone()));
            assert_eq!(emit_response(response, &config, &load_report).unwrap(), None);
        }

        assert!(dir.path().join("report_summary.json").is_file());
        assert!(dir.path().join("report_summary.csv").is_file());
        let stats: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("estadisticas.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stats["meta"]["records"], 2);
        assert_eq!(stats["meta"]["coords"]["withCoords"], 1);
        assert!(stats["meta"]["generatedAt"].is_string());
        assert_eq!(stats["colonias"]["CENTRO"]["label"], "Centro");
        assert!(dir.path().join("estadisticas.csv").is_file());
    }

    #[test]
    fn failed_responses_report_their_reason() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let failure = Response::failure(FailureKind::Panic, "top10 report failed: boom", None);

        let reason = emit_response(failure, &config, &LoadReport::default()).unwrap();
        assert_eq!(reason.as_deref(), Some("top10 report failed: boom"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
