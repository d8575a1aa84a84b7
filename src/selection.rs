//! Selection building.
//!
//! Reports never filter on their own: callers narrow the snapshot to a list
//! of ids first, and this is where the type/status/month filters apply.

use crate::types::{DateField, Filters, MonthKey, Record, RecordId, Snapshot, Status};

/// Ids from `snapshot.all_ids`, in order, whose record matches every set
/// filter. Ids without a record are dropped.
pub fn build_selection(snapshot: &Snapshot, filters: &Filters) -> Vec<RecordId> {
    snapshot
        .all_ids
        .iter()
        .filter(|id| {
            snapshot
                .get(id)
                .is_some_and(|record| matches_filters(record, filters))
        })
        .cloned()
        .collect()
}

pub fn matches_filters(record: &Record, filters: &Filters) -> bool {
    if let Some(wanted) = non_blank(&filters.type_filter) {
        if record.report_type().as_deref() != Some(wanted) {
            return false;
        }
    }
    if let Some(wanted) = non_blank(&filters.status_filter) {
        let matches = match (Status::parse(wanted), record.status()) {
            (Some(a), Some(b)) => a == b,
            _ => record.status_text().as_deref() == Some(wanted),
        };
        if !matches {
            return false;
        }
    }
    if let Some(wanted) = non_blank(&filters.month_filter) {
        let month = match record.date_field() {
            DateField::Valid(date) => MonthKey::from_date(date),
            DateField::Absent | DateField::Invalid => MonthKey::no_date(),
        };
        if month.as_str() != wanted {
            return false;
        }
    }
    true
}

fn non_blank(filter: &Option<String>) -> Option<&str> {
    filter.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
