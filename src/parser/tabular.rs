use std::borrow::Cow;
use std::io::Cursor;
use std::sync::LazyLock;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use chrono::{NaiveDateTime, NaiveTime};
use encoding_rs::Encoding;
use regex::Regex;
use tracing::{debug, warn};

use super::table::{Cell, RecordTable};
use super::SourceFormat;
use crate::error::ExtractError;

static GRANTED_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)concedido|concessao|deferido|registrado").unwrap());
// "indeferido" contains "deferido"; refusals are dropped here as they are for
// XML classifications, unlike a plain substring match on the status.
static REFUSED_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)indeferid").unwrap());

pub const STATUS_COLUMN_CANDIDATES: &[&str] = &["situacao", "status", "situacao_processo", "estado"];

// ── CSV ──

/// Decode with the first encoding in `encodings` that accepts the bytes, then
/// read a delimited table whose first row is the header.
pub fn read_csv(bytes: &[u8], delimiter: u8, encodings: &[String]) -> Result<RecordTable, ExtractError> {
    let text = decode(bytes, encodings)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(ExtractError::structural(SourceFormat::Csv, "missing header row"));
    }
    let mut table = RecordTable::new(header_names(headers.iter()));

    let mut skipped = 0;
    for record in reader.records() {
        let record = record?;
        if record.len() > headers.len() {
            skipped += 1;
            continue;
        }
        table.push_row(record.iter().map(|field| cell(field.to_string())).collect());
    }
    if skipped > 0 {
        warn!(skipped, "skipped CSV rows with more fields than the header");
    }
    Ok(table)
}

fn decode<'a>(bytes: &'a [u8], encodings: &[String]) -> Result<Cow<'a, str>, ExtractError> {
    let mut tried: Vec<&'static Encoding> = Vec::new();
    for label in encodings {
        let Some(encoding) = resolve_encoding(label) else {
            warn!(label = %label, "unknown encoding label");
            continue;
        };
        if tried.contains(&encoding) {
            continue;
        }
        tried.push(encoding);

        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            debug!(encoding = encoding.name(), "decoded CSV");
            return Ok(match text {
                Cow::Borrowed(s) => Cow::Borrowed(s.strip_prefix('\u{feff}').unwrap_or(s)),
                Cow::Owned(s) => Cow::Owned(s.strip_prefix('\u{feff}').unwrap_or(&s).to_string()),
            });
        }
    }
    Err(ExtractError::Encoding {
        tried: encodings.join(", "),
    })
}

/// Accepts WHATWG labels plus the common "latin-1" spelling.
pub fn resolve_encoding(label: &str) -> Option<&'static Encoding> {
    let label = label.trim();
    Encoding::for_label(label.as_bytes()).or_else(|| Encoding::for_label(label.replace('-', "").as_bytes()))
}

// ── Spreadsheet ──

/// Read the first worksheet of an xlsx workbook; its first row is the header.
pub fn read_spreadsheet(bytes: &[u8]) -> Result<RecordTable, ExtractError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ExtractError::structural(SourceFormat::Spreadsheet, "workbook has no worksheet"))??;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| ExtractError::structural(SourceFormat::Spreadsheet, "worksheet is empty"))?;
    let names: Vec<String> = header.iter().map(|c| cell_text(c).unwrap_or_default()).collect();
    let mut table = RecordTable::new(header_names(names.iter().map(String::as_str)));

    for row in rows {
        let cells: Vec<Cell> = row.iter().map(cell_text).collect();
        if cells.iter().all(Option::is_none) {
            continue;
        }
        table.push_row(cells);
    }
    Ok(table)
}

pub fn cell_text(data: &Data) -> Cell {
    match data {
        Data::Empty => None,
        Data::String(s) => cell(s.clone()),
        Data::DateTime(dt) if dt.is_datetime() => match dt.as_datetime() {
            Some(value) => cell(render_datetime(value)),
            None => cell(data.to_string()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => cell(s.clone()),
        other => cell(other.to_string()),
    }
}

/// Dates without a time of day print as `YYYY-MM-DD`.
fn render_datetime(value: NaiveDateTime) -> String {
    if value.time() == NaiveTime::MIN {
        value.format("%Y-%m-%d").to_string()
    } else {
        value.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

// ── Shared ──

fn cell(value: String) -> Cell {
    (!value.trim().is_empty()).then_some(value)
}

/// Blank headers get positional names.
fn header_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names
        .enumerate()
        .map(|(i, name)| {
            let name = name.trim();
            if name.is_empty() {
                format!("column_{}", i + 1)
            } else {
                name.to_string()
            }
        })
        .collect()
}

pub fn is_granted_status(status: &str) -> bool {
    GRANTED_STATUS_RE.is_match(status) && !REFUSED_STATUS_RE.is_match(status)
}

/// Keep rows whose status column reads as granted. Without a status column
/// every row is kept.
pub fn keep_granted_rows(table: RecordTable) -> RecordTable {
    let Some(status) = table.find_column(STATUS_COLUMN_CANDIDATES) else {
        debug!("no status column, keeping all rows");
        return table;
    };
    let kept = table.filtered(|row| row[status].as_deref().is_some_and(is_granted_status));
    debug!(before = table.len(), after = kept.len(), column = %table.columns()[status], "status filter");
    kept
}
