pub mod class;
pub mod gazette;
pub mod table;
pub mod tabular;
pub mod tree;

use std::fmt;
use std::path::Path;

use crate::error::ExtractError;
use table::RecordTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Xml,
    Csv,
    Spreadsheet,
}

impl SourceFormat {
    /// Format from the file extension (`.xml`, `.csv`, `.xlsx`), case-insensitive.
    pub fn from_path(path: &Path) -> Result<Self, ExtractError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xml" => Ok(SourceFormat::Xml),
            "csv" => Ok(SourceFormat::Csv),
            "xlsx" => Ok(SourceFormat::Spreadsheet),
            _ => Err(ExtractError::UnsupportedFormat(ext)),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceFormat::Xml => "XML",
            SourceFormat::Csv => "CSV",
            SourceFormat::Spreadsheet => "spreadsheet",
        };
        f.write_str(name)
    }
}

/// Format-specific knobs for extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub grant_code: String,
    pub csv_delimiter: u8,
    pub csv_encodings: Vec<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            grant_code: gazette::DEFAULT_GRANT_CODE.to_string(),
            csv_delimiter: b';',
            csv_encodings: ["utf-8", "latin-1", "iso-8859-1", "cp1252"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

pub struct Extraction {
    pub table: RecordTable,
    /// Issue number; only XML gazettes carry one.
    pub issue: Option<String>,
}

/// Extract granted records from one document.
pub fn extract(bytes: &[u8], format: SourceFormat, opts: &ExtractOptions) -> Result<Extraction, ExtractError> {
    match format {
        SourceFormat::Xml => {
            let (table, issue) = gazette::extract(bytes, &opts.grant_code)?;
            Ok(Extraction { table, issue })
        }
        SourceFormat::Csv => {
            let table = tabular::read_csv(bytes, opts.csv_delimiter, &opts.csv_encodings)?;
            Ok(Extraction {
                table: tabular::keep_granted_rows(table),
                issue: None,
            })
        }
        SourceFormat::Spreadsheet => {
            let table = tabular::read_spreadsheet(bytes)?;
            Ok(Extraction {
                table: tabular::keep_granted_rows(table),
                issue: None,
            })
        }
    }
}
