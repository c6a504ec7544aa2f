use thiserror::Error;

use crate::parser::SourceFormat;

/// Failures that reject a whole document. An empty result is not one of them.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("could not parse {format} document: {reason}")]
    StructuralParse { format: SourceFormat, reason: String },

    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("unreadable spreadsheet: {0}")]
    Spreadsheet(#[from] calamine::XlsxError),

    #[error("could not decode CSV with any of the configured encodings ({tried})")]
    Encoding { tried: String },

    #[error("unsupported file format: {0:?}")]
    UnsupportedFormat(String),
}

impl ExtractError {
    pub fn structural(format: SourceFormat, reason: impl Into<String>) -> Self {
        ExtractError::StructuralParse {
            format,
            reason: reason.into(),
        }
    }

    /// True when the document itself could not be read as its declared format.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ExtractError::UnsupportedFormat(_))
    }
}
