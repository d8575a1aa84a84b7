use crate::util::{
    date_from_epoch_millis, parse_month_name, parse_report_date, spanish_month_label,
    spanish_month_name,
};
use chrono::{Datelike, NaiveDate};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tabled::Tabled;

/// Property names that may carry the report type, in lookup order.
pub const TYPE_FIELDS: &[&str] = &["Tipo de reporte", "Tipo de Reporte", "tipo", "TIPO", "Tipo"];
/// Property names that may carry the report status, in lookup order.
pub const STATUS_FIELDS: &[&str] = &["Estado Reporte", "Estado reporte", "Estado", "ESTADO", "estado"];
/// Property names that may carry the report date, in lookup order.
pub const DATE_FIELDS: &[&str] = &["Fecha reporte", "Fecha Reporte", "Fecha", "FECHA"];
/// Known spellings of the section ("transi") property.
pub const SECTION_FIELDS: &[&str] = &["transi", "Transi", "TRANSI"];

/// Neighbourhood (colonia) properties, in lookup order.
pub const COLONIA_FIELDS: &[&str] = &["Colonia", "COLONIA", "colonia", "NOMBRE"];
/// Place-name properties that override the colonia when present.
pub const NAME_FIELDS: &[&str] = &["name", "NAME", "Name"];
/// Electoral section properties, in lookup order.
pub const SECCION_FIELDS: &[&str] = &["seccion", "SECCION", "Seccion", "SECCIÓN"];
/// Month-name properties, preferred over the report date when present.
pub const MONTH_FIELDS: &[&str] = &["mes", "Mes", "MES"];

/// Numeric dates below ten digits are not epoch milliseconds.
const MIN_EPOCH_MILLIS: u64 = 1_000_000_000;

pub const NO_SECTION: &str = "Sin sección";
pub const NO_DATE: &str = "Sin fecha";

/// Identifier of a record inside a snapshot.
///
/// JSON sources use both strings and integers for ids, so both are accepted
/// and normalized to their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = RecordId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer record id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<RecordId, E> {
                Ok(RecordId::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<RecordId, E> {
                Ok(RecordId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordId, E> {
                Ok(RecordId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordId, E> {
                Ok(RecordId(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// Outcome of looking up a record's report date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Absent,
    Invalid,
    Valid(NaiveDate),
}

/// One citizen report: the raw property bag of a geoportal feature.
///
/// No field is required. Accessors return `None` for missing keys, `null`,
/// and whitespace-only strings, and hand back trimmed text otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn field(&self, key: &str) -> Option<Cow<'_, str>> {
        self.fields.get(key).and_then(value_text)
    }

    /// First present field among `candidates`.
    pub fn first_field(&self, candidates: &[&str]) -> Option<Cow<'_, str>> {
        candidates.iter().find_map(|key| self.field(key))
    }

    pub fn report_type(&self) -> Option<Cow<'_, str>> {
        self.first_field(TYPE_FIELDS)
    }

    pub fn status_text(&self) -> Option<Cow<'_, str>> {
        self.first_field(STATUS_FIELDS)
    }

    /// Recognized status, `None` when absent or outside the vocabulary.
    pub fn status(&self) -> Option<Status> {
        self.status_text().and_then(|s| Status::parse(&s))
    }

    pub fn date_field(&self) -> DateField {
        let raw = DATE_FIELDS
            .iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|v| value_text(v).is_some());
        match raw {
            None => DateField::Absent,
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .filter(|ms| ms.unsigned_abs() >= MIN_EPOCH_MILLIS)
                .and_then(date_from_epoch_millis)
                .map_or(DateField::Invalid, DateField::Valid),
            Some(Value::String(s)) => {
                parse_report_date(s).map_or(DateField::Invalid, DateField::Valid)
            }
            Some(_) => DateField::Invalid,
        }
    }

    /// Section code, looked up by the known spellings first and then by any
    /// key equal to `transi` ignoring ASCII case.
    pub fn section(&self) -> String {
        SECTION_FIELDS
            .iter()
            .find_map(|key| self.field(key))
            .or_else(|| {
                self.fields
                    .iter()
                    .filter(|(k, _)| k.eq_ignore_ascii_case("transi"))
                    .find_map(|(_, v)| value_text(v))
            })
            .map(Cow::into_owned)
            .unwrap_or_else(|| NO_SECTION.to_string())
    }

    /// Neighbourhood name. `name` wins over `Colonia` when both are set.
    pub fn colonia(&self) -> Option<Cow<'_, str>> {
        self.first_field(NAME_FIELDS)
            .or_else(|| self.first_field(COLONIA_FIELDS))
    }

    /// Electoral section as written, not the transit section.
    pub fn seccion(&self) -> Option<Cow<'_, str>> {
        self.first_field(SECCION_FIELDS)
    }

    /// Lowercase Spanish month name from the month column, else from the
    /// report date.
    pub fn month_name(&self) -> Option<String> {
        if let Some(raw) = self.first_field(MONTH_FIELDS) {
            return parse_month_name(&raw);
        }
        match self.date_field() {
            DateField::Valid(date) => spanish_month_name(date.month()).map(str::to_string),
            DateField::Absent | DateField::Invalid => None,
        }
    }
}

fn value_text(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(Cow::Borrowed(s))
            }
        }
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// The four statuses the reports count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "Pendiente")]
    Pending,
    #[serde(rename = "En atención")]
    InProgress,
    #[serde(rename = "Atendido")]
    Resolved,
    #[serde(rename = "No compete")]
    NotApplicable,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::InProgress,
        Status::Resolved,
        Status::NotApplicable,
    ];

    /// Match a raw status against the vocabulary after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|s| s.label() == raw)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Status::Pending => "Pendiente",
            Status::InProgress => "En atención",
            Status::Resolved => "Atendido",
            Status::NotApplicable => "No compete",
        }
    }

    /// Pending and in-progress reports make up the backlog.
    pub fn is_open(self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `YYYY-MM` grouping key, or the `Sin fecha` sentinel.
///
/// Derived ordering is plain string ordering, which is chronological for
/// real months and puts the sentinel last.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonthKey(String);

impl MonthKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(format!("{:04}-{:02}", date.year(), date.month()))
    }

    pub fn no_date() -> Self {
        Self(NO_DATE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn year_month(&self) -> Option<(i32, u32)> {
        let (year, month) = self.0.split_once('-')?;
        let year = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        (1..=12).contains(&month).then_some((year, month))
    }

    /// Display label: capitalized Spanish month name.
    pub fn label(&self) -> String {
        match self.year_month() {
            Some((_, month)) => spanish_month_label(month),
            None => NO_DATE.to_string(),
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Top10,
    Summary,
    Sections,
    Statistics,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Top10 => write!(f, "top10"),
            ReportKind::Summary => write!(f, "summary"),
            ReportKind::Sections => write!(f, "sections"),
            ReportKind::Statistics => write!(f, "statistics"),
        }
    }
}

/// Full record store plus the enumeration of every known id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub records_by_id: HashMap<RecordId, Record>,
    #[serde(default)]
    pub all_ids: Vec<RecordId>,
}

impl Snapshot {
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records_by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.records_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records_by_id.is_empty()
    }
}

/// Top10 filter parameters. Narrowing happens in the selection builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_filter: Option<String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.type_filter.is_none() && self.status_filter.is_none() && self.month_filter.is_none()
    }
}

/// Per-status counters shared by the summary and section reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    #[serde(rename = "Atendido")]
    pub resolved: u64,
    #[serde(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    pub in_progress: u64,
    #[serde(rename = "No compete")]
    pub not_applicable: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: Status) {
        match status {
            Status::Pending => self.pending += 1,
            Status::InProgress => self.in_progress += 1,
            Status::Resolved => self.resolved += 1,
            Status::NotApplicable => self.not_applicable += 1,
        }
    }

    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Pending => self.pending,
            Status::InProgress => self.in_progress,
            Status::Resolved => self.resolved,
            Status::NotApplicable => self.not_applicable,
        }
    }

    /// Pending plus in-progress.
    pub fn open(&self) -> u64 {
        Status::ALL
            .into_iter()
            .filter(|s| s.is_open())
            .map(|s| self.get(s))
            .sum()
    }

    pub fn total(&self) -> u64 {
        Status::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Overall status tally of the Top10 report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTally {
    #[serde(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    pub in_progress: u64,
    #[serde(rename = "otros")]
    pub other: u64,
}

impl StatusTally {
    pub fn record(&mut self, status: Option<Status>) {
        match status {
            Some(Status::Pending) => self.pending += 1,
            Some(Status::InProgress) => self.in_progress += 1,
            _ => self.other += 1,
        }
    }
}

/// One type/month cell of the Top10 grouping. `total` counts pending
/// reports only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMonthCounts {
    #[serde(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    pub in_progress: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthLabel {
    pub key: MonthKey,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopType {
    #[serde(rename = "type")]
    pub report_type: String,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Top10Report {
    pub by_type: BTreeMap<String, BTreeMap<MonthKey, TypeMonthCounts>>,
    pub months: Vec<MonthLabel>,
    pub top10: Vec<TopType>,
    pub status_tally: StatusTally,
    pub filters: Filters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSummary {
    #[serde(flatten)]
    pub counts: StatusCounts,
    #[serde(rename = "PendientesMes")]
    pub pending_this_month: u64,
    #[serde(rename = "PendientesAcumulado")]
    pub pending_cumulative: u64,
    #[serde(rename = "IndicadorDias")]
    pub aging_indicator: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub summary: BTreeMap<MonthKey, MonthSummary>,
    pub sorted_months: Vec<MonthKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionReport {
    pub sections: BTreeMap<String, BTreeMap<MonthKey, StatusCounts>>,
    pub sorted_months: Vec<MonthKey>,
    pub sorted_sections: Vec<String>,
}

/// Tallies of one scope (everything, one colonia or one electoral
/// section). Cross-tab keys join their parts with `|`, e.g.
/// `marzo|Bache|Pendiente`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    /// Name as first written in the data; the map key is its normalized form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub total: u64,
    pub mes: BTreeMap<String, u64>,
    pub tipo: BTreeMap<String, u64>,
    pub estado: BTreeMap<String, u64>,
    pub mes_tipo: BTreeMap<String, u64>,
    pub mes_estado: BTreeMap<String, u64>,
    pub tipo_estado: BTreeMap<String, u64>,
    pub mes_tipo_estado: BTreeMap<String, u64>,
}

impl EntityStats {
    pub fn labelled(label: Option<String>) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    pub fn record(&mut self, mes: &str, tipo: &str, estado: &str) {
        fn bump(counter: &mut BTreeMap<String, u64>, key: String) {
            *counter.entry(key).or_default() += 1;
        }
        self.total += 1;
        bump(&mut self.mes, mes.to_string());
        bump(&mut self.tipo, tipo.to_string());
        bump(&mut self.estado, estado.to_string());
        bump(&mut self.mes_tipo, format!("{mes}|{tipo}"));
        bump(&mut self.mes_estado, format!("{mes}|{estado}"));
        bump(&mut self.tipo_estado, format!("{tipo}|{estado}"));
        bump(&mut self.mes_tipo_estado, format!("{mes}|{tipo}|{estado}"));
    }

    /// Most frequent type; ties go to the first in name order.
    pub fn top_type(&self) -> Option<(&str, u64)> {
        self.tipo
            .iter()
            .fold(None, |best: Option<(&str, u64)>, (name, &count)| match best {
                Some((_, top)) if top >= count => best,
                _ => Some((name.as_str(), count)),
            })
    }
}

/// Coordinate diagnostics of the source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordStats {
    pub total: usize,
    pub with_coords: usize,
    pub missing_coords: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub records: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<CoordStats>,
}

/// Distinct values seen, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsValues {
    pub mes: BTreeSet<String>,
    pub tipo: BTreeSet<String>,
    pub estado: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub meta: StatsMeta,
    pub values: StatsValues,
    pub global: EntityStats,
    pub colonias: BTreeMap<String, EntityStats>,
    pub secciones: BTreeMap<String, EntityStats>,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct Top10Row {
    #[serde(rename = "Rank")]
    #[tabled(rename = "Rank")]
    pub rank: usize,
    #[serde(rename = "Tipo")]
    #[tabled(rename = "Tipo")]
    pub report_type: String,
    #[serde(rename = "Pendientes")]
    #[tabled(rename = "Pendientes")]
    pub total: u64,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct TypeMonthRow {
    #[serde(rename = "Tipo")]
    #[tabled(rename = "Tipo")]
    pub report_type: String,
    #[serde(rename = "Mes")]
    #[tabled(rename = "Mes")]
    pub month: String,
    #[serde(rename = "Nombre")]
    #[tabled(rename = "Nombre")]
    pub label: String,
    #[serde(rename = "Pendiente")]
    #[tabled(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    #[tabled(rename = "En atención")]
    pub in_progress: u64,
    #[serde(rename = "Total")]
    #[tabled(rename = "Total")]
    pub total: u64,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct SummaryRow {
    #[serde(rename = "Mes")]
    #[tabled(rename = "Mes")]
    pub month: String,
    #[serde(rename = "Atendido")]
    #[tabled(rename = "Atendido")]
    pub resolved: u64,
    #[serde(rename = "Pendiente")]
    #[tabled(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    #[tabled(rename = "En atención")]
    pub in_progress: u64,
    #[serde(rename = "No compete")]
    #[tabled(rename = "No compete")]
    pub not_applicable: u64,
    #[serde(rename = "PendientesMes")]
    #[tabled(rename = "PendientesMes")]
    pub pending_this_month: u64,
    #[serde(rename = "PendientesAcumulado")]
    #[tabled(rename = "PendientesAcumulado")]
    pub pending_cumulative: u64,
    #[serde(rename = "IndicadorDias")]
    #[tabled(rename = "IndicadorDias")]
    pub aging_indicator: u64,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct SectionRow {
    #[serde(rename = "Seccion")]
    #[tabled(rename = "Seccion")]
    pub section: String,
    #[serde(rename = "Mes")]
    #[tabled(rename = "Mes")]
    pub month: String,
    #[serde(rename = "Atendido")]
    #[tabled(rename = "Atendido")]
    pub resolved: u64,
    #[serde(rename = "Pendiente")]
    #[tabled(rename = "Pendiente")]
    pub pending: u64,
    #[serde(rename = "En atención")]
    #[tabled(rename = "En atención")]
    pub in_progress: u64,
    #[serde(rename = "No compete")]
    #[tabled(rename = "No compete")]
    pub not_applicable: u64,
}

#[derive(Debug, Serialize, Tabled, Clone)]
pub struct StatisticsRow {
    #[serde(rename = "Ambito")]
    #[tabled(rename = "Ambito")]
    pub scope: String,
    #[serde(rename = "Clave")]
    #[tabled(rename = "Clave")]
    pub key: String,
    #[serde(rename = "Nombre")]
    #[tabled(rename = "Nombre")]
    pub label: String,
    #[serde(rename = "Total")]
    #[tabled(rename = "Total")]
    pub total: u64,
    #[serde(rename = "Tipo principal")]
    #[tabled(rename = "Tipo principal")]
    pub top_type: String,
    #[serde(rename = "Reportes del tipo")]
    #[tabled(rename = "Reportes del tipo")]
    pub top_type_total: u64,
}
