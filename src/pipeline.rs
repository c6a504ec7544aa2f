use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::{self, IssueRegistration, SaveReport, StoredRecord};
use crate::error::ExtractError;
use crate::filter::{self, FilterOptions};
use crate::parser::class::normalize_column;
use crate::parser::table::{
    RecordTable, CLASS_CODE, CLASS_COLUMN_CANDIDATES, GRANT_DATE, HOLDER_NAME, MARK_NAME, PROCESS_NUMBER,
    SPEC_COLUMN_CANDIDATES,
};
use crate::parser::{self, ExtractOptions, SourceFormat};

/// Header fragments and the canonical name they map to, checked in order.
const RENAME_RULES: &[(&[&str], &str)] = &[
    (&["numero", "processo"], PROCESS_NUMBER),
    (&["marca"], MARK_NAME),
    (&["classe", "nice"], CLASS_CODE),
    (&["titular", "requerente", "proprietario"], HOLDER_NAME),
    (&["data", "concessao"], GRANT_DATE),
];

pub struct PipelineOutput {
    pub table: RecordTable,
    pub issue: Option<String>,
    /// Rows extracted before filtering.
    pub extracted: usize,
}

/// Rename tabular headers to canonical names. A canonical name already taken
/// by an earlier column is not reassigned.
pub fn normalize_columns(table: &mut RecordTable) {
    for idx in 0..table.columns().len() {
        let lowered = table.columns()[idx].to_lowercase();
        let Some(&(_, target)) = RENAME_RULES
            .iter()
            .find(|(fragments, _)| fragments.iter().any(|f| lowered.contains(f)))
        else {
            continue;
        };
        if table.column_index(target).is_none() {
            table.rename_column(idx, target);
        }
    }
}

/// Extract, normalize and filter one document.
pub fn run(
    bytes: &[u8],
    format: SourceFormat,
    filters: &FilterOptions,
    opts: &ExtractOptions,
) -> Result<PipelineOutput, ExtractError> {
    let parser::Extraction { mut table, issue } = parser::extract(bytes, format, opts)?;
    let extracted = table.len();

    if format != SourceFormat::Xml {
        normalize_columns(&mut table);
    }

    let class_idx = table.find_column(CLASS_COLUMN_CANDIDATES);
    if let Some(idx) = class_idx {
        normalize_column(&mut table, idx);
    }

    if !filters.is_empty() {
        let class_column = class_idx.map(|i| table.columns()[i].clone());
        let spec_column = table
            .find_column(SPEC_COLUMN_CANDIDATES)
            .map(|i| table.columns()[i].clone());
        table = filter::filter_records(&table, filters, class_column.as_deref(), spec_column.as_deref());
    }

    Ok(PipelineOutput {
        table,
        issue,
        extracted,
    })
}

// ── Batches ──

pub enum Outcome {
    /// Records survived filtering. `saved` is `None` when nothing was persisted.
    Processed {
        table: RecordTable,
        extracted: usize,
        saved: Option<SaveReport>,
    },
    Empty {
        extracted: usize,
    },
    Failed(String),
}

pub struct DocumentReport {
    pub name: String,
    pub issue: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchTally {
    pub processed: usize,
    pub empty: usize,
    pub failed: usize,
    pub rows_saved: usize,
    pub duplicates: usize,
}

impl BatchTally {
    pub fn add(&mut self, report: &DocumentReport) {
        match &report.outcome {
            Outcome::Processed { saved, .. } => {
                self.processed += 1;
                if let Some(s) = saved {
                    self.rows_saved += s.saved;
                    self.duplicates += s.duplicates;
                }
            }
            Outcome::Empty { .. } => self.empty += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn print(&self) {
        println!(
            "{} processed, {} empty, {} failed. Saved {} rows ({} duplicates skipped).",
            self.processed, self.empty, self.failed, self.rows_saved, self.duplicates,
        );
    }
}

/// Runs documents through the pipeline and, given a connection, persists
/// the results.
pub struct Ingest<'a> {
    pub conn: Option<&'a Connection>,
    pub filters: &'a FilterOptions,
    pub opts: &'a ExtractOptions,
    pub batch_size: usize,
}

impl Ingest<'_> {
    pub fn document(&self, name: &str, bytes: &[u8]) -> DocumentReport {
        let report = |issue, outcome| DocumentReport {
            name: name.to_string(),
            issue,
            outcome,
        };

        let format = match SourceFormat::from_path(Path::new(name)) {
            Ok(f) => f,
            Err(e) => return report(None, Outcome::Failed(e.to_string())),
        };
        let out = match run(bytes, format, self.filters, self.opts) {
            Ok(out) => out,
            Err(e) => {
                warn!(document = name, error = %e, "extraction failed");
                return report(None, Outcome::Failed(e.to_string()));
            }
        };

        if out.table.is_empty() {
            info!(document = name, extracted = out.extracted, "no records after filtering");
            return report(out.issue, Outcome::Empty { extracted: out.extracted });
        }

        let saved = match self.conn {
            Some(conn) => match self.save(conn, name, &out) {
                Ok(s) => Some(s),
                Err(e) => return report(out.issue, Outcome::Failed(format!("{:#}", e))),
            },
            None => None,
        };
        report(
            out.issue,
            Outcome::Processed {
                table: out.table,
                extracted: out.extracted,
                saved,
            },
        )
    }

    fn save(&self, conn: &Connection, name: &str, out: &PipelineOutput) -> anyhow::Result<SaveReport> {
        if let Some(issue) = out.issue.as_deref() {
            match db::register_issue(conn, issue) {
                Ok(IssueRegistration::Registered) => info!(issue, "registered gazette issue"),
                Ok(IssueRegistration::AlreadyRegistered) => {}
                Err(e) => warn!(issue, error = %e, "could not register issue"),
            }
        }
        let rows = StoredRecord::from_table(&out.table, out.issue.as_deref());
        let report = db::append_records(conn, &rows, self.batch_size)?;
        info!(
            document = name,
            saved = report.saved,
            duplicates = report.duplicates,
            errors = report.errors.len(),
            "saved records"
        );
        Ok(report)
    }

    /// Process files strictly one after another. A failing file is reported
    /// and the batch continues.
    pub fn paths(&self, paths: &[PathBuf]) -> (Vec<DocumentReport>, BatchTally) {
        let pb = ProgressBar::new(paths.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut reports = Vec::with_capacity(paths.len());
        let mut tally = BatchTally::default();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            pb.set_message(name.clone());

            let report = match std::fs::read(path) {
                Ok(bytes) => self.document(&name, &bytes),
                Err(e) => DocumentReport {
                    name,
                    issue: None,
                    outcome: Outcome::Failed(format!("Failed to read {:?}: {}", path, e)),
                },
            };
            tally.add(&report);
            reports.push(report);
            pb.inc(1);
        }
        pb.finish_and_clear();
        (reports, tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("tests/fixtures/{}", name)).unwrap()
    }

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn renames_tabular_headers() {
        let mut t = RecordTable::new(strings(&[
            "Numero do Processo",
            "Marca",
            "Classe Nice",
            "Requerente",
            "Data de Concessao",
            "Situacao",
        ]));
        normalize_columns(&mut t);
        assert_eq!(
            t.columns(),
            &[PROCESS_NUMBER, MARK_NAME, CLASS_CODE, HOLDER_NAME, GRANT_DATE, "Situacao"]
        );
    }

    #[test]
    fn first_header_keeps_canonical_name() {
        let mut t = RecordTable::new(strings(&["processo", "numero_revista", "marca"]));
        normalize_columns(&mut t);
        assert_eq!(t.columns(), &[PROCESS_NUMBER, "numero_revista", MARK_NAME]);
    }

    #[test]
    fn xml_classes_are_normalized() {
        let out = run(
            &fixture("gazette_sample.xml"),
            SourceFormat::Xml,
            &FilterOptions::default(),
            &ExtractOptions::default(),
        )
        .unwrap();
        assert_eq!(out.extracted, 5);
        assert_eq!(out.issue.as_deref(), Some("2790"));
        let class = out.table.column_index(CLASS_CODE).unwrap();
        let classes: Vec<Option<&str>> = (0..out.table.len()).map(|r| out.table.value(r, class)).collect();
        assert_eq!(classes, vec![Some("8"), Some("21"), None, Some("3"), Some("Cl. 99")]);
    }

    #[test]
    fn xml_with_filters() {
        let filters = FilterOptions {
            classes: strings(&["08", "3"]),
            keywords: strings(&["ferramentas manuais", "SABONETES"]),
        };
        let out = run(
            &fixture("gazette_sample.xml"),
            SourceFormat::Xml,
            &filters,
            &ExtractOptions::default(),
        )
        .unwrap();
        let processes: Vec<&str> = (0..out.table.len()).map(|r| out.table.value(r, 0).unwrap()).collect();
        assert_eq!(processes, vec!["901234567", "905123123"]);
    }

    #[test]
    fn csv_pipeline() {
        let filters = FilterOptions {
            classes: strings(&["9", "8"]),
            keywords: Vec::new(),
        };
        let out = run(
            &fixture("granted.csv"),
            SourceFormat::Csv,
            &filters,
            &ExtractOptions::default(),
        )
        .unwrap();
        assert_eq!(out.extracted, 3);
        assert!(out.issue.is_none());
        let process = out.table.column_index(PROCESS_NUMBER).unwrap();
        let class = out.table.column_index(CLASS_CODE).unwrap();
        assert_eq!(out.table.len(), 2);
        assert_eq!(out.table.value(0, process), Some("920000001"));
        assert_eq!(out.table.value(0, class), Some("9"));
        assert_eq!(out.table.value(1, class), Some("8"));
    }

    #[test]
    fn keywords_need_a_specification_column() {
        let csv = b"processo;classe;situacao\n1;8;Concedido\n";
        let filters = FilterOptions {
            classes: Vec::new(),
            keywords: strings(&["nada"]),
        };
        let out = run(csv, SourceFormat::Csv, &filters, &ExtractOptions::default()).unwrap();
        assert_eq!(out.table.len(), 1);
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let err = run(
            b"<revista><processo>",
            SourceFormat::Xml,
            &FilterOptions::default(),
            &ExtractOptions::default(),
        );
        assert!(matches!(err, Err(e) if e.is_structural()));
    }

    #[test]
    fn document_saves_and_registers_issue() {
        let conn = memory();
        let filters = FilterOptions::default();
        let opts = ExtractOptions::default();
        let ingest = Ingest {
            conn: Some(&conn),
            filters: &filters,
            opts: &opts,
            batch_size: 2,
        };
        let report = ingest.document("rm2790.xml", &fixture("gazette_sample.xml"));
        assert_eq!(report.issue.as_deref(), Some("2790"));
        match &report.outcome {
            Outcome::Processed { saved: Some(s), .. } => {
                assert_eq!(s.saved, 5);
                assert!(s.errors.is_empty());
            }
            _ => panic!("expected saved records"),
        }
        assert_eq!(db::list_registered_issues(&conn).unwrap(), vec!["2790"]);

        let again = ingest.document("rm2790.xml", &fixture("gazette_sample.xml"));
        match again.outcome {
            Outcome::Processed { saved: Some(s), .. } => assert_eq!(s.duplicates, 5),
            _ => panic!("expected duplicates"),
        }
    }

    #[test]
    fn batch_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("rm2790.xml");
        std::fs::write(&good, fixture("gazette_sample.xml")).unwrap();
        let broken = dir.path().join("broken.xml");
        std::fs::write(&broken, "<revista><processo>").unwrap();
        let empty = dir.path().join("empty.csv");
        std::fs::write(&empty, "processo;situacao\n1;Arquivado\n").unwrap();
        let unsupported = dir.path().join("notes.txt");
        std::fs::write(&unsupported, "hello").unwrap();
        let missing = dir.path().join("missing.xml");

        let filters = FilterOptions::default();
        let opts = ExtractOptions::default();
        let ingest = Ingest {
            conn: None,
            filters: &filters,
            opts: &opts,
            batch_size: 100,
        };
        let (reports, tally) = ingest.paths(&[broken, good, empty, unsupported, missing]);
        assert_eq!(reports.len(), 5);
        assert_eq!(
            tally,
            BatchTally {
                processed: 1,
                empty: 1,
                failed: 3,
                rows_saved: 0,
                duplicates: 0,
            }
        );
        assert!(matches!(reports[1].outcome, Outcome::Processed { saved: None, .. }));
        assert_eq!(reports[1].name, "rm2790.xml");
    }
}
