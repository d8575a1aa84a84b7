use crate::types::{
    DateField, EntityStats, Filters, MonthKey, MonthLabel, MonthSummary, Record, RecordId,
    SectionReport, Snapshot, StatisticsReport, Status, StatusCounts, StatusTally, StatsMeta,
    SummaryReport, Top10Report, TopType, TypeMonthCounts, NO_SECTION,
};
use crate::util::{locale_cmp, normalize_key, normalize_seccion};
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

pub const TOP_TYPES_LIMIT: usize = 10;

/// Backlog weight per month of age in the aging indicator.
pub const AGING_DAYS_PER_MONTH: u64 = 30;

/// Sections listed here sort first, in this order.
pub const NO_TYPE: &str = "Sin tipo";
pub const NO_STATUS: &str = "Sin estado";
pub const NO_MONTH: &str = "sin_mes";
pub const NO_COLONIA: &str = "SIN_COLONIA";
pub const NO_SECCION: &str = "SIN_SECCION";

pub const SECTION_PRIORITY: [&str; 8] = ["AA", "BA", "CA", "AB", "BB", "CC", "DD", NO_SECTION];

static SECTION_RANK: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    SECTION_PRIORITY
        .iter()
        .enumerate()
        .map(|(rank, code)| (*code, rank))
        .collect()
});

/// Pending/in-progress breakdown by type and month, plus the ten types with
/// the most pending reports.
///
/// Records without a type or a status are skipped. A missing or unparseable
/// date groups the record under `Sin fecha`. `filters` are echoed back
/// unchanged; narrowing is done when the selection is built.
pub fn generate_top10_report(
    snapshot: &Snapshot,
    selection: &[RecordId],
    filters: &Filters,
) -> Top10Report {
    let mut by_type: BTreeMap<String, BTreeMap<MonthKey, TypeMonthCounts>> = BTreeMap::new();
    let mut status_tally = StatusTally::default();
    // Pending totals in first-seen order; the ranking sort is stable on it.
    let mut pending_totals: Vec<(String, u64)> = Vec::new();
    let mut pending_index: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;

    for id in selection {
        let Some(record) = snapshot.get(id) else {
            skipped += 1;
            continue;
        };
        let (Some(report_type), Some(status_text)) = (record.report_type(), record.status_text())
        else {
            skipped += 1;
            continue;
        };

        let status = Status::parse(&status_text);
        status_tally.record(status);

        let month = match record.date_field() {
            DateField::Valid(date) => MonthKey::from_date(date),
            DateField::Absent | DateField::Invalid => MonthKey::no_date(),
        };
        let cell = by_type
            .entry(report_type.to_string())
            .or_default()
            .entry(month)
            .or_default();

        match status {
            Some(Status::Pending) => {
                cell.pending += 1;
                cell.total += 1;
                match pending_index.get(&*report_type) {
                    Some(&idx) => pending_totals[idx].1 += 1,
                    None => {
                        pending_index.insert(report_type.to_string(), pending_totals.len());
                        pending_totals.push((report_type.into_owned(), 1));
                    }
                }
            }
            Some(Status::InProgress) => cell.in_progress += 1,
            _ => {}
        }
    }

    if !filters.is_empty() {
        debug!(?filters, "top10 filters are applied by the selection builder");
    }
    debug!(
        selected = selection.len(),
        skipped,
        types = by_type.len(),
        "top10 report folded"
    );

    let months: BTreeSet<&MonthKey> = by_type.values().flat_map(|m| m.keys()).collect();
    let months = months
        .into_iter()
        .map(|key| MonthLabel {
            key: key.clone(),
            label: key.label(),
        })
        .collect();

    pending_totals.sort_by(|a, b| b.1.cmp(&a.1));
    let top10 = pending_totals
        .into_iter()
        .take(TOP_TYPES_LIMIT)
        .map(|(report_type, total)| TopType { report_type, total })
        .collect();

    Top10Report {
        by_type,
        months,
        top10,
        status_tally,
        filters: filters.clone(),
    }
}

/// Month-by-month status counts with the running backlog and the aging
/// indicator.
///
/// Records need a status and a parseable date. Unrecognized statuses still
/// open their month but add to no counter.
pub fn generate_monthly_summary(snapshot: &Snapshot, selection: &[RecordId]) -> SummaryReport {
    let mut summary: BTreeMap<MonthKey, MonthSummary> = BTreeMap::new();
    let mut skipped = 0usize;

    for id in selection {
        let Some((record, month)) = dated_record(snapshot, id) else {
            skipped += 1;
            continue;
        };
        let row = summary.entry(month).or_default();
        if let Some(status) = record.status() {
            row.counts.record(status);
        }
    }

    let sorted_months: Vec<MonthKey> = summary.keys().cloned().collect();
    let last = sorted_months.len().saturating_sub(1);
    let mut cumulative = 0u64;
    for (idx, row) in summary.values_mut().enumerate() {
        row.pending_this_month = row.counts.open();
        cumulative += row.pending_this_month;
        row.pending_cumulative = cumulative;
        row.aging_indicator = row.pending_this_month * aging_factor(last - idx);
    }

    debug!(
        selected = selection.len(),
        skipped,
        months = sorted_months.len(),
        "monthly summary folded"
    );

    SummaryReport {
        summary,
        sorted_months,
    }
}

/// Weight for a month `distance` positions before the most recent one.
/// The most recent month weighs 1 so its backlog still shows.
pub fn aging_factor(distance: usize) -> u64 {
    if distance == 0 {
        1
    } else {
        distance as u64 * AGING_DAYS_PER_MONTH
    }
}

/// Status counts per section and month.
///
/// Same skip rules as the monthly summary. Sections in
/// [`SECTION_PRIORITY`] lead in that order; the rest follow alphabetically.
pub fn generate_section_report(snapshot: &Snapshot, selection: &[RecordId]) -> SectionReport {
    let mut sections: BTreeMap<String, BTreeMap<MonthKey, StatusCounts>> = BTreeMap::new();
    let mut months: BTreeSet<MonthKey> = BTreeSet::new();
    let mut skipped = 0usize;

    for id in selection {
        let Some((record, month)) = dated_record(snapshot, id) else {
            skipped += 1;
            continue;
        };
        months.insert(month.clone());
        let counts = sections
            .entry(record.section())
            .or_default()
            .entry(month)
            .or_default();
        if let Some(status) = record.status() {
            counts.record(status);
        }
    }

    let mut sorted_sections: Vec<String> = sections.keys().cloned().collect();
    sorted_sections.sort_by(|a, b| compare_sections(a, b));

    debug!(
        selected = selection.len(),
        skipped,
        sections = sorted_sections.len(),
        "section report folded"
    );

    SectionReport {
        sections,
        sorted_months: months.into_iter().collect(),
        sorted_sections,
    }
}

pub fn compare_sections(a: &str, b: &str) -> Ordering {
    match (SECTION_RANK.get(a), SECTION_RANK.get(b)) {
        (Some(ra), Some(rb)) => ra.cmp(rb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => locale_cmp(a, b),
    }
}

/// Month/type/status tallies with their cross-tabs, overall and per
/// colonia and electoral section.
///
/// Every selected record counts. Missing values fall into `Sin tipo`,
/// `Sin estado` and `sin_mes`; statuses are counted as written. Colonias
/// and sections are keyed by their normalized text and keep the first
/// spelling seen as the label.
pub fn generate_statistics(snapshot: &Snapshot, selection: &[RecordId]) -> StatisticsReport {
    let mut report = StatisticsReport::default();
    let mut skipped = 0u64;

    for id in selection {
        let Some(record) = snapshot.get(id) else {
            skipped += 1;
            continue;
        };
        let mes = record.month_name().unwrap_or_else(|| NO_MONTH.to_string());
        let tipo = record.report_type();
        let tipo = tipo.as_deref().unwrap_or(NO_TYPE);
        let estado = record.status_text();
        let estado = estado.as_deref().unwrap_or(NO_STATUS);

        report.global.record(&mes, tipo, estado);

        let colonia = record.colonia();
        entity(&mut report.colonias, colonia.as_deref(), normalize_key, NO_COLONIA)
            .record(&mes, tipo, estado);
        let seccion = record.seccion();
        entity(&mut report.secciones, seccion.as_deref(), normalize_seccion, NO_SECCION)
            .record(&mes, tipo, estado);

        report.values.mes.insert(mes);
        report.values.tipo.insert(tipo.to_string());
        report.values.estado.insert(estado.to_string());
    }

    debug!(
        selected = selection.len(),
        skipped,
        colonias = report.colonias.len(),
        secciones = report.secciones.len(),
        "statistics folded"
    );

    report.meta = StatsMeta {
        records: report.global.total,
        skipped,
        ..StatsMeta::default()
    };
    report
}

fn entity<'a>(
    entities: &'a mut BTreeMap<String, EntityStats>,
    raw: Option<&str>,
    normalize: fn(&str) -> String,
    fallback: &str,
) -> &'a mut EntityStats {
    let key = raw
        .map(normalize)
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| fallback.to_string());
    entities
        .entry(key)
        .or_insert_with(|| EntityStats::labelled(raw.map(str::to_string)))
}

// A record with a status and a parseable date, keyed by its month.
fn dated_record<'a>(snapshot: &'a Snapshot, id: &RecordId) -> Option<(&'a Record, MonthKey)> {
    let record = snapshot.get(id)?;
    record.status_text()?;
    match record.date_field() {
        DateField::Valid(date) => Some((record, MonthKey::from_date(date))),
        DateField::Absent | DateField::Invalid => None,
    }
}
