use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::aggregator::SourcedFeedback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(ExportError::UnsupportedFormat(raw.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to serialize feedback: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn render(records: &[SourcedFeedback], format: ExportFormat) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(records)?),
        ExportFormat::Csv => to_csv(records),
    }
}

/// Header row is the key set of the first record; later records are written
/// against it, with absent keys as empty cells.
fn to_csv(records: &[SourcedFeedback]) -> Result<String, ExportError> {
    let rows = records
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;

    let Some(Value::Object(first)) = rows.first() else {
        return Ok(String::new());
    };
    let header: Vec<String> = first.keys().cloned().collect();

    let mut out = String::new();
    write_row(&mut out, header.iter().map(String::as_str));
    for row in &rows {
        let cells: Vec<String> = header
            .iter()
            .map(|key| row.get(key).map(cell_text).unwrap_or_default())
            .collect();
        write_row(&mut out, cells.iter().map(String::as_str));
    }
    Ok(out)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if cell.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::FeedbackSource;
    use chrono::{TimeZone, Utc};
    use docent_schema::{FeedbackRecord, FeedbackType};

    fn sample() -> Vec<SourcedFeedback> {
        let mut record = FeedbackRecord::new("M1", "C1", "U1", FeedbackType::Positive, "thumbsup")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        record.question = Some("deploy, then \"verify\"?".into());
        vec![SourcedFeedback {
            record,
            source: FeedbackSource::Database,
        }]
    }

    #[test]
    fn parse_formats() {
        assert_eq!(ExportFormat::parse("json").unwrap(), ExportFormat::Json);
        assert_eq!(ExportFormat::parse("CSV").unwrap(), ExportFormat::Csv);
        assert!(matches!(
            ExportFormat::parse("xml"),
            Err(ExportError::UnsupportedFormat(f)) if f == "xml"
        ));
    }

    #[test]
    fn json_export_is_an_array_with_source() {
        let text = render(&sample(), ExportFormat::Json).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0]["source"], "database");
        assert_eq!(value[0]["feedback_type"], "positive");
        assert_eq!(value[0]["message_id"], "M1");
    }

    #[test]
    fn csv_header_comes_from_first_record() {
        let text = render(&sample(), ExportFormat::Csv).unwrap();
        let mut lines = text.split("\r\n");
        let header = lines.next().unwrap();
        let columns: Vec<&str> = header.split(',').collect();
        assert!(columns.contains(&"message_id"));
        assert!(columns.contains(&"source"));
        assert!(columns.contains(&"question"));

        let row = lines.next().unwrap();
        assert!(row.contains("\"deploy, then \"\"verify\"\"?\""));
        assert!(row.contains("database"));
    }

    #[test]
    fn empty_exports() {
        assert_eq!(render(&[], ExportFormat::Csv).unwrap(), "");
        assert_eq!(render(&[], ExportFormat::Json).unwrap(), "[]");
    }
}
