//! Command-line interface argument parsing.

use crate::types::{Filters, ReportKind};
use clap::Parser;
use std::path::PathBuf;

/// Geoportal report builder
///
/// Aggregates citizen reports into the top-10 by type, monthly backlog and
/// section tables. Reads either a snapshot JSON (`recordsById` + `allIds`)
/// or the raw GeoJSON export.
///
/// Examples:
///   geoportal_reports --input Solicitudes.geojson
///   geoportal_reports --input snapshot.json --report summary --output-dir out
///   geoportal_reports --input Solicitudes.geojson --status-filter Pendiente
///   geoportal_reports --serve < requests.jsonl
///   geoportal_reports --check-assets public/
///   geoportal_reports --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Snapshot JSON or GeoJSON FeatureCollection to report on
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present_any = ["serve", "init_config", "check_assets"]
    )]
    pub input: Option<PathBuf>,

    /// Which report(s) to generate
    #[arg(short, long, value_enum, default_value = "all")]
    pub report: ReportChoice,

    /// Keep only reports of this type
    #[arg(long, value_name = "TYPE")]
    pub type_filter: Option<String>,

    /// Keep only reports with this status (e.g. "Pendiente")
    #[arg(long, value_name = "STATUS")]
    pub status_filter: Option<String>,

    /// Keep only reports from this month (YYYY-MM or "Sin fecha")
    #[arg(long, value_name = "MONTH")]
    pub month_filter: Option<String>,

    /// Directory for the JSON and CSV outputs
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Rows shown per table preview
    #[arg(long, value_name = "ROWS")]
    pub preview_rows: Option<usize>,

    /// Skip the CSV exports
    #[arg(long)]
    pub no_csv: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "GEOPORTAL_REPORTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Answer JSON requests from stdin, one per line, until EOF
    #[arg(long, conflicts_with = "input")]
    pub serve: bool,

    /// Dry-run the offline asset cache against a built site directory
    #[arg(long, value_name = "DIR", conflicts_with_all = ["input", "serve"])]
    pub check_assets: Option<PathBuf>,

    /// Write a default .geoportal-reports.toml and exit
    #[arg(long)]
    pub init_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportChoice {
    Top10,
    Summary,
    Sections,
    Statistics,
    #[default]
    All,
}

impl ReportChoice {
    pub fn kinds(self) -> Vec<ReportKind> {
        match self {
            ReportChoice::Top10 => vec![ReportKind::Top10],
            ReportChoice::Summary => vec![ReportKind::Summary],
            ReportChoice::Sections => vec![ReportKind::Sections],
            ReportChoice::Statistics => vec![ReportKind::Statistics],
            ReportChoice::All => vec![
                ReportKind::Top10,
                ReportKind::Summary,
                ReportKind::Sections,
                ReportKind::Statistics,
            ],
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }
        if self.preview_rows == Some(0) {
            return Err("Preview rows must be at least 1".to_string());
        }
        if let Some(ref month) = self.month_filter {
            let month = month.trim();
            let well_formed = month == crate::types::NO_DATE
                || (month.len() == 7
                    && month.as_bytes()[4] == b'-'
                    && month
                        .chars()
                        .enumerate()
                        .all(|(i, c)| i == 4 || c.is_ascii_digit()));
            if !well_formed {
                return Err(format!("Month filter must look like 2024-03, got '{month}'"));
            }
        }
        if let Some(ref dir) = self.check_assets {
            if !dir.is_dir() {
                return Err(format!("Site directory does not exist: {}", dir.display()));
            }
        }
        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(format!("Input file does not exist: {}", input.display()));
            }
        }
        Ok(())
    }

    pub fn filters(&self) -> Filters {
        Filters {
            type_filter: self.type_filter.clone(),
            status_filter: self.status_filter.clone(),
            month_filter: self.month_filter.clone(),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            input: None,
            report: ReportChoice::All,
            type_filter: None,
            status_filter: None,
            month_filter: None,
            output_dir: None,
            preview_rows: None,
            no_csv: false,
            config: None,
            serve: true,
            check_assets: None,
            init_config: false,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn test_parse_filters() {
        let args = Args::try_parse_from([
            "geoportal_reports",
            "--serve",
            "--report",
            "top10",
            "--status-filter",
            "Pendiente",
            "--month-filter",
            "2024-03",
        ])
        .unwrap();
        assert_eq!(args.report, ReportChoice::Top10);
        let filters = args.filters();
        assert_eq!(filters.status_filter.as_deref(), Some("Pendiente"));
        assert_eq!(filters.month_filter.as_deref(), Some("2024-03"));
        assert!(filters.type_filter.is_none());
    }

    #[test]
    fn test_input_required_without_serve() {
        assert!(Args::try_parse_from(["geoportal_reports"]).is_err());
        assert!(Args::try_parse_from(["geoportal_reports", "--init-config"]).is_ok());
        assert!(Args::try_parse_from(["geoportal_reports", "--check-assets", "public"]).is_ok());
        assert!(Args::try_parse_from([
            "geoportal_reports",
            "--check-assets",
            "public",
            "--serve"
        ])
        .is_err());
    }

    #[test]
    fn test_validation_month_filter() {
        let mut args = make_args();
        args.month_filter = Some("2024-3".to_string());
        assert!(args.validate().is_err());
        args.month_filter = Some("2024-03".to_string());
        assert!(args.validate().is_ok());
        args.month_filter = Some("Sin fecha".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_report_choice_kinds() {
        assert_eq!(ReportChoice::All.kinds().len(), 4);
        assert_eq!(ReportChoice::Statistics.kinds(), vec![ReportKind::Statistics]);
        assert_eq!(ReportChoice::Sections.kinds(), vec![ReportKind::Sections]);
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
