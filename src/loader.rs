use crate::types::{CoordStats, Record, RecordId, Snapshot};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Properties that may hold a feature's id when `feature.id` is missing.
pub const ID_FIELDS: &[&str] = &["OBJECTID", "id", "ID", "Folio"];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is neither a report snapshot nor a GeoJSON FeatureCollection")]
    UnrecognizedShape { path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub total_rows: usize,
    pub loaded_rows: usize,
    pub missing_properties: usize,
    pub duplicate_ids: usize,
    /// Loaded features without usable coordinates. Counted, not dropped.
    pub missing_coords: usize,
}

impl LoadReport {
    pub fn coord_stats(&self) -> CoordStats {
        CoordStats {
            total: self.loaded_rows,
            with_coords: self.loaded_rows - self.missing_coords,
            missing_coords: self.missing_coords,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    geometry: Option<Value>,
}

/// Load a snapshot from either a snapshot JSON (`recordsById` + `allIds`)
/// or a GeoJSON FeatureCollection of citizen reports.
pub fn load_snapshot(path: &Path) -> Result<(Snapshot, LoadReport), LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if value.get("type").and_then(Value::as_str) == Some("FeatureCollection") {
        let features = match value {
            Value::Object(mut root) => match root.remove("features") {
                Some(Value::Array(features)) => features,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(from_features(features))
    } else if value.get("recordsById").is_some() {
        let snapshot: Snapshot = serde_json::from_value(value).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(from_snapshot(snapshot))
    } else {
        Err(LoadError::UnrecognizedShape {
            path: path.to_path_buf(),
        })
    }
}

fn from_snapshot(mut snapshot: Snapshot) -> (Snapshot, LoadReport) {
    if snapshot.all_ids.is_empty() {
        let mut ids: Vec<RecordId> = snapshot.records_by_id.keys().cloned().collect();
        ids.sort();
        snapshot.all_ids = ids;
    }
    let report = LoadReport {
        total_rows: snapshot.len(),
        loaded_rows: snapshot.len(),
        ..LoadReport::default()
    };
    (snapshot, report)
}

pub fn from_features(features: Vec<Value>) -> (Snapshot, LoadReport) {
    let mut snapshot = Snapshot::default();
    let mut report = LoadReport::default();

    for (idx, feature) in features.into_iter().enumerate() {
        report.total_rows += 1;
        let (raw_id, props, geometry) = match serde_json::from_value::<RawFeature>(feature) {
            Ok(RawFeature {
                id,
                properties: Some(props),
                geometry,
            }) => (id, props, geometry),
            _ => {
                report.missing_properties += 1;
                continue;
            }
        };

        // Positional ids are 1-based to match the row numbers users see, and
        // prefixed so they never collide with a real id.
        let id = feature_id(raw_id.as_ref(), &props)
            .unwrap_or_else(|| RecordId::new(format!("#{}", idx + 1)));
        match snapshot.records_by_id.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(%id, "duplicate feature id, keeping the first");
                report.duplicate_ids += 1;
            }
            Entry::Vacant(slot) => {
                if !has_valid_coords(geometry.as_ref()) {
                    report.missing_coords += 1;
                }
                slot.insert(Record::new(props));
                snapshot.all_ids.push(id);
                report.loaded_rows += 1;
            }
        }
    }

    (snapshot, report)
}

fn feature_id(id: Option<&Value>, props: &Map<String, Value>) -> Option<RecordId> {
    id.into_iter()
        .chain(ID_FIELDS.iter().filter_map(|key| props.get(*key)))
        .find_map(value_id)
}

fn value_id(v: &Value) -> Option<RecordId> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(RecordId::new(s.trim())),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_u64().map(|u| u.to_string()))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("{f:.0}"))
            })
            .map(RecordId::new),
        _ => None,
    }
}

// Point geometry with a longitude/latitude pair inside WGS84 bounds.
fn has_valid_coords(geometry: Option<&Value>) -> bool {
    let Some(coords) = geometry
        .and_then(|g| g.get("coordinates"))
        .and_then(Value::as_array)
    else {
        return false;
    };
    match (
        coords.first().and_then(Value::as_f64),
        coords.get(1).and_then(Value::as_f64),
    ) {
        (Some(lon), Some(lat)) => (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat),
        _ => false,
    }
}
