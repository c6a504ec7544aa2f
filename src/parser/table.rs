use serde::Serialize;

pub const PROCESS_NUMBER: &str = "process_number";
pub const MARK_NAME: &str = "mark_name";
pub const CLASS_CODE: &str = "class_code";
pub const HOLDER_NAME: &str = "holder_name";
pub const AGENT_NAME: &str = "agent_name";
pub const GRANT_DATE: &str = "grant_date";
pub const CLASS_STATUS: &str = "class_status";
pub const SPECIFICATION_TEXT: &str = "specification_text";
pub const SPECIFICATION_TRANSLATION: &str = "specification_translation";

/// Column order of tables built from gazette records.
pub const CANONICAL_COLUMNS: [&str; 9] = [
    PROCESS_NUMBER,
    MARK_NAME,
    CLASS_CODE,
    HOLDER_NAME,
    AGENT_NAME,
    GRANT_DATE,
    CLASS_STATUS,
    SPECIFICATION_TEXT,
    SPECIFICATION_TRANSLATION,
];

/// Header fragments that identify the class column of any extracted table.
pub const CLASS_COLUMN_CANDIDATES: &[&str] = &[CLASS_CODE, "classe", "classe_nice", "class"];

/// Header fragments that identify the specification column.
pub const SPEC_COLUMN_CANDIDATES: &[&str] = &["specification", "especificacao", "especificação"];

/// One granted class of one granted process, as read from a gazette.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantedRecord {
    pub process_number: String,
    pub mark_name: String,
    pub class_code: String,
    pub holder_name: String,
    pub agent_name: String,
    pub grant_date: String,
    pub class_status: String,
    pub specification_text: String,
    pub specification_translation: String,
}

impl GrantedRecord {
    fn into_row(self) -> Vec<Cell> {
        vec![
            Some(self.process_number),
            Some(self.mark_name),
            Some(self.class_code),
            Some(self.holder_name),
            Some(self.agent_name),
            Some(self.grant_date),
            Some(self.class_status),
            Some(self.specification_text),
            Some(self.specification_translation),
        ]
    }
}

/// A missing value is `None`; an empty string is a present, empty value.
pub type Cell = Option<String>;

/// Named columns over rows of optional text cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>) -> Self {
        RecordTable {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_records(records: Vec<GrantedRecord>) -> Self {
        let mut table = RecordTable::new(CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect());
        table.rows = records.into_iter().map(GrantedRecord::into_row).collect();
        table
    }

    /// Append a row, padding missing trailing cells and dropping extra ones.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }

    pub fn rename_column(&mut self, column: usize, name: &str) {
        if let Some(c) = self.columns.get_mut(column) {
            *c = name.to_string();
        }
    }

    /// Rewrite every cell of one column in place.
    pub fn map_column<F>(&mut self, column: usize, mut f: F)
    where
        F: FnMut(Option<&str>) -> Cell,
    {
        for row in &mut self.rows {
            if let Some(cell) = row.get_mut(column) {
                *cell = f(cell.as_deref());
            }
        }
    }

    /// New table holding the rows accepted by `keep`, in their original order.
    pub fn filtered<F>(&self, mut keep: F) -> RecordTable
    where
        F: FnMut(&[Cell]) -> bool,
    {
        RecordTable {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// First column whose lowercased name contains a candidate. Candidates are
    /// tried in order, so an earlier candidate wins over an earlier column.
    pub fn find_column(&self, candidates: &[&str]) -> Option<usize> {
        let lowered: Vec<String> = self.columns.iter().map(|c| c.to_lowercase()).collect();
        candidates.iter().find_map(|candidate| {
            let candidate = candidate.to_lowercase();
            lowered.iter().position(|col| col.contains(&candidate))
        })
    }

    /// Rows as JSON objects keyed by column name; missing cells become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(col, cell)| {
                        let value = match cell {
                            Some(v) => serde_json::Value::String(v.clone()),
                            None => serde_json::Value::Null,
                        };
                        (col.clone(), value)
                    })
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}
