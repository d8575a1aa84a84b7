use crate::types::{
    EntityStats, SectionReport, SectionRow, StatisticsReport, StatisticsRow, SummaryReport,
    SummaryRow, Top10Report, Top10Row, TypeMonthRow,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tabled::{settings::Style, Table, Tabled};

pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    std::fs::write(path, s).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn top10_rows(report: &Top10Report) -> Vec<Top10Row> {
    report
        .top10
        .iter()
        .enumerate()
        .map(|(idx, t)| Top10Row {
            rank: idx + 1,
            report_type: t.report_type.clone(),
            total: t.total,
        })
        .collect()
}

/// Type/month breakdown for the ranked types, in rank then month order.
pub fn type_month_rows(report: &Top10Report) -> Vec<TypeMonthRow> {
    let mut rows = Vec::new();
    for top in &report.top10 {
        let Some(months) = report.by_type.get(&top.report_type) else {
            continue;
        };
        for month in &report.months {
            if let Some(cell) = months.get(&month.key) {
                rows.push(TypeMonthRow {
                    report_type: top.report_type.clone(),
                    month: month.key.to_string(),
                    label: month.label.clone(),
                    pending: cell.pending,
                    in_progress: cell.in_progress,
                    total: cell.total,
                });
            }
        }
    }
    rows
}

pub fn summary_rows(report: &SummaryReport) -> Vec<SummaryRow> {
    report
        .sorted_months
        .iter()
        .filter_map(|month| {
            let row = report.summary.get(month)?;
            Some(SummaryRow {
                month: month.to_string(),
                resolved: row.counts.resolved,
                pending: row.counts.pending,
                in_progress: row.counts.in_progress,
                not_applicable: row.counts.not_applicable,
                pending_this_month: row.pending_this_month,
                pending_cumulative: row.pending_cumulative,
                aging_indicator: row.aging_indicator,
            })
        })
        .collect()
}

/// One row per section/month pair that has data, sections in report order.
pub fn section_rows(report: &SectionReport) -> Vec<SectionRow> {
    let mut rows = Vec::new();
    for section in &report.sorted_sections {
        let Some(months) = report.sections.get(section) else {
            continue;
        };
        for month in &report.sorted_months {
            if let Some(counts) = months.get(month) {
                rows.push(SectionRow {
                    section: section.clone(),
                    month: month.to_string(),
                    resolved: counts.resolved,
                    pending: counts.pending,
                    in_progress: counts.in_progress,
                    not_applicable: counts.not_applicable,
                });
            }
        }
    }
    rows
}

/// One row for the whole dataset, then one per electoral section and per
/// colonia, each in key order.
pub fn statistics_rows(report: &StatisticsReport) -> Vec<StatisticsRow> {
    let row = |scope: &str, key: &str, stats: &EntityStats| {
        let (top_type, top_type_total) = stats.top_type().unwrap_or(("", 0));
        StatisticsRow {
            scope: scope.to_string(),
            key: key.to_string(),
            label: stats.label.clone().unwrap_or_default(),
            total: stats.total,
            top_type: top_type.to_string(),
            top_type_total,
        }
    };
    std::iter::once(row("global", "", &report.global))
        .chain(report.secciones.iter().map(|(k, v)| row("seccion", k, v)))
        .chain(report.colonias.iter().map(|(k, v)| row("colonia", k, v)))
        .collect()
}

pub fn preview_table_rows<T>(rows: &[T], max_rows: usize)
where
    T: Tabled + Clone,
{
    let slice: Vec<T> = rows.iter().take(max_rows).cloned().collect();
    if slice.is_empty() {
        println!("(no rows)\n");
        return;
    }
    let table_str = Table::new(slice).with(Style::markdown()).to_string();
    println!("{}\n", table_str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::{
        generate_monthly_summary, generate_section_report, generate_statistics,
        generate_top10_report,
    };
    use crate::types::{Filters, RecordId, Snapshot};
    use serde_json::json;

    fn snapshot() -> Snapshot {
        serde_json::from_value(json!({
            "recordsById": {
                "1": {"Tipo de reporte": "Bache", "Estado Reporte": "Pendiente", "Fecha reporte": "2024-01-05", "transi": "ZZ"},
                "2": {"Tipo de reporte": "Bache", "Estado Reporte": "Pendiente", "Fecha reporte": "2024-02-05", "transi": "AA"},
                "3": {"Tipo de reporte": "Fuga de agua", "Estado Reporte": "En atención", "Fecha reporte": "2024-01-20"},
                "4": {"Tipo de reporte": "Fuga de agua", "Estado Reporte": "Pendiente", "Fecha reporte": "2024-02-20"}
            },
            "allIds": ["1", "2", "3", "4"]
        }))
        .unwrap()
    }

    #[test]
    fn top10_rows_are_ranked() {
        let snap = snapshot();
        let report = generate_top10_report(&snap, &snap.all_ids, &Filters::default());
        let rows = top10_rows(&report);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].rank, rows[0].report_type.as_str(), rows[0].total), (1, "Bache", 2));
        assert_eq!((rows[1].rank, rows[1].total), (2, 1));

        let breakdown = type_month_rows(&report);
        let keys: Vec<(&str, &str)> = breakdown
            .iter()
            .map(|r| (r.report_type.as_str(), r.month.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Bache", "2024-01"),
                ("Bache", "2024-02"),
                ("Fuga de agua", "2024-01"),
                ("Fuga de agua", "2024-02"),
            ]
        );
        assert_eq!(breakdown[2].in_progress, 1);
        assert_eq!(breakdown[0].label, "Enero");
    }

    #[test]
    fn section_rows_follow_section_order() {
        let snap = snapshot();
        let report = generate_section_report(&snap, &snap.all_ids);
        let rows = section_rows(&report);
        let order: Vec<&str> = rows.iter().map(|r| r.section.as_str()).collect();
        assert_eq!(order, vec!["AA", "Sin sección", "Sin sección", "ZZ"]);
    }

    #[test]
    fn writes_csv_and_json() {
        let snap = snapshot();
        let report = generate_monthly_summary(&snap, &snap.all_ids);
        let dir = tempfile::tempdir().unwrap();

        let csv_path = dir.path().join("resumen.csv");
        write_csv(&csv_path, &summary_rows(&report)).unwrap();
        let csv_text = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(
            lines.next(),
            Some("Mes,Atendido,Pendiente,En atención,No compete,PendientesMes,PendientesAcumulado,IndicadorDias")
        );
        assert_eq!(lines.next(), Some("2024-01,0,1,1,0,2,2,60"));
        assert_eq!(lines.next(), Some("2024-02,0,2,0,0,2,4,2"));

        let json_path = dir.path().join("resumen.json");
        write_json(&json_path, &report).unwrap();
        let back: SummaryReport =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn statistics_rows_cover_every_scope() {
        let mut snap = snapshot();
        let places = [
            ("1", "Bache", "Centro", "12"),
            ("2", "Bache", "centro", "12"),
            ("3", "Poda", "Obrera", "7"),
        ];
        for (id, tipo, colonia, seccion) in places {
            let record = snap.records_by_id.get_mut(&RecordId::from(id)).unwrap();
            *record = serde_json::from_value(json!({
                "Tipo de reporte": tipo,
                "Estado Reporte": "Pendiente",
                "Colonia": colonia,
                "seccion": seccion
            }))
            .unwrap();
        }
        let report = generate_statistics(&snap, &snap.all_ids);
        let rows = statistics_rows(&report);

        let scopes: Vec<(&str, &str, u64)> = rows
            .iter()
            .map(|r| (r.scope.as_str(), r.key.as_str(), r.total))
            .collect();
        assert_eq!(
            scopes,
            vec![
                ("global", "", 4),
                ("seccion", "12", 2),
                ("seccion", "7", 1),
                ("seccion", "SIN_SECCION", 1),
                ("colonia", "CENTRO", 2),
                ("colonia", "OBRERA", 1),
                ("colonia", "SIN_COLONIA", 1),
            ]
        );
        assert_eq!(rows[0].top_type, "Bache");
        assert_eq!(rows[0].top_type_total, 2);
        assert_eq!(rows[4].label, "Centro");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("estadisticas.csv");
        write_csv(&path, &rows).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines().next(),
            Some("Ambito,Clave,Nombre,Total,Tipo principal,Reportes del tipo")
        );
    }
}
