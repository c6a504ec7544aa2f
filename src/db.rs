use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::parser::class::normalize_class;
use crate::parser::table::{
    RecordTable, CLASS_CODE, CLASS_STATUS, HOLDER_NAME, MARK_NAME, PROCESS_NUMBER, SPEC_COLUMN_CANDIDATES,
};

pub const DEFAULT_STATUS: &str = "Deferido";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trademark_records (
            id            INTEGER PRIMARY KEY,
            process       TEXT,
            mark          TEXT,
            class         TEXT,
            specification TEXT,
            holder        TEXT,
            status        TEXT NOT NULL DEFAULT 'Deferido',
            issue_number  TEXT,
            verification  TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_records_identity ON trademark_records(
            COALESCE(process, ''), COALESCE(class, ''), COALESCE(issue_number, '')
        );
        CREATE INDEX IF NOT EXISTS idx_records_class ON trademark_records(class);
        CREATE INDEX IF NOT EXISTS idx_records_issue ON trademark_records(issue_number);
        CREATE INDEX IF NOT EXISTS idx_records_process ON trademark_records(process);

        CREATE TABLE IF NOT EXISTS gazette_issues (
            issue_number TEXT PRIMARY KEY,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Saving ──

/// One row of `trademark_records`, before insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub process: Option<String>,
    pub mark: Option<String>,
    pub class: Option<String>,
    pub specification: Option<String>,
    pub holder: Option<String>,
    pub status: String,
    pub issue_number: Option<String>,
}

impl StoredRecord {
    /// Map a pipeline table onto store rows. Columns the table lacks become
    /// NULL; a missing status becomes "Deferido".
    pub fn from_table(table: &RecordTable, issue: Option<&str>) -> Vec<StoredRecord> {
        let process = table.column_index(PROCESS_NUMBER);
        let mark = table.column_index(MARK_NAME);
        let class = table.column_index(CLASS_CODE);
        let holder = table.column_index(HOLDER_NAME);
        let status = table.column_index(CLASS_STATUS);
        let spec = table.find_column(SPEC_COLUMN_CANDIDATES);
        let issue = issue.map(str::trim).filter(|i| !i.is_empty()).map(str::to_string);

        let get = |row: usize, col: Option<usize>| col.and_then(|c| table.value(row, c)).map(str::to_string);
        (0..table.len())
            .map(|row| StoredRecord {
                process: get(row, process),
                mark: get(row, mark),
                class: get(row, class),
                specification: get(row, spec),
                holder: get(row, holder),
                status: get(row, status).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
                issue_number: issue.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub process: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveReport {
    pub total: usize,
    pub saved: usize,
    pub duplicates: usize,
    pub errors: Vec<RowError>,
}

const INSERT_RECORD: &str = "INSERT OR IGNORE INTO trademark_records
     (process, mark, class, specification, holder, status, issue_number)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Insert rows in transactions of `batch_size`. A failed batch is rolled back
/// and retried row by row; rows already stored are counted as duplicates.
pub fn append_records(conn: &Connection, rows: &[StoredRecord], batch_size: usize) -> Result<SaveReport> {
    let mut report = SaveReport {
        total: rows.len(),
        ..Default::default()
    };

    for (n, batch) in rows.chunks(batch_size.max(1)).enumerate() {
        match insert_batch(conn, batch) {
            Ok(inserted) => {
                report.saved += inserted;
                report.duplicates += batch.len() - inserted;
            }
            Err(e) => {
                warn!(batch = n + 1, error = %e, "batch insert failed, retrying row by row");
                for row in batch {
                    match insert_record(conn, row) {
                        Ok(1) => report.saved += 1,
                        Ok(_) => report.duplicates += 1,
                        Err(e) => report.errors.push(RowError {
                            process: row.process.clone(),
                            message: e.to_string(),
                        }),
                    }
                }
            }
        }
    }

    debug!(
        total = report.total,
        saved = report.saved,
        duplicates = report.duplicates,
        errors = report.errors.len(),
        "append_records"
    );
    Ok(report)
}

fn insert_batch(conn: &Connection, batch: &[StoredRecord]) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare_cached(INSERT_RECORD)?;
        for r in batch {
            count += stmt.execute(rusqlite::params![
                r.process, r.mark, r.class, r.specification, r.holder, r.status, r.issue_number,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

fn insert_record(conn: &Connection, r: &StoredRecord) -> rusqlite::Result<usize> {
    conn.prepare_cached(INSERT_RECORD)?.execute(rusqlite::params![
        r.process, r.mark, r.class, r.specification, r.holder, r.status, r.issue_number,
    ])
}

// ── Querying ──

#[derive(Debug, Clone, Serialize)]
pub struct RecordRow {
    pub id: i64,
    pub process: Option<String>,
    pub mark: Option<String>,
    pub class: Option<String>,
    pub specification: Option<String>,
    pub holder: Option<String>,
    pub status: String,
    pub issue_number: Option<String>,
    pub verification: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Exact class, compared after normalization ("03" finds "3").
    pub class: Option<String>,
    /// Case-insensitive substring of the mark.
    pub mark: Option<String>,
    pub issue: Option<String>,
    pub limit: Option<usize>,
}

/// Newest records first, read `page_size` rows at a time until a short page
/// or the limit.
pub fn query_records(conn: &Connection, query: &RecordQuery, page_size: usize) -> Result<Vec<RecordRow>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(class) = query.class.as_deref().and_then(normalize_class) {
        conditions.push(format!("class = ?{}", params.len() + 1));
        params.push(Box::new(class));
    }
    if let Some(mark) = query.mark.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        conditions.push(format!("LOWER(mark) LIKE ?{} ESCAPE '\\'", params.len() + 1));
        params.push(Box::new(format!("%{}%", escape_like(&mark.to_lowercase()))));
    }
    if let Some(issue) = query.issue.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
        conditions.push(format!("issue_number = ?{}", params.len() + 1));
        params.push(Box::new(issue.to_string()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let sql = format!(
        "SELECT id, process, mark, class, specification, holder, status, issue_number,
                verification, created_at
         FROM trademark_records{}
         ORDER BY created_at DESC, id DESC
         LIMIT ?{} OFFSET ?{}",
        where_clause,
        params.len() + 1,
        params.len() + 2
    );

    let page_size = page_size.max(1);
    let mut stmt = conn.prepare(&sql)?;
    let mut out = Vec::new();
    loop {
        let want = match query.limit {
            Some(limit) if out.len() >= limit => break,
            Some(limit) => page_size.min(limit - out.len()),
            None => page_size,
        };
        let mut page_params: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let (want_sql, offset_sql) = (want as i64, out.len() as i64);
        page_params.push(&want_sql);
        page_params.push(&offset_sql);

        let page = stmt
            .query_map(page_params.as_slice(), |row| {
                Ok(RecordRow {
                    id: row.get(0)?,
                    process: row.get(1)?,
                    mark: row.get(2)?,
                    class: row.get(3)?,
                    specification: row.get(4)?,
                    holder: row.get(5)?,
                    status: row.get(6)?,
                    issue_number: row.get(7)?,
                    verification: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let short = page.len() < want;
        out.extend(page);
        if short {
            break;
        }
    }
    Ok(out)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ── Issues ──

pub fn delete_issue_records(conn: &Connection, issue: &str) -> Result<usize> {
    let n = conn
        .execute("DELETE FROM trademark_records WHERE issue_number = ?1", [issue.trim()])
        .with_context(|| format!("Failed to delete records of issue {}", issue))?;
    Ok(n)
}

/// Distinct issue numbers present in the records, newest first.
pub fn list_issue_numbers(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT issue_number FROM trademark_records
         WHERE issue_number IS NOT NULL AND issue_number != ''",
    )?;
    let mut issues = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    sort_issues_desc(&mut issues);
    Ok(issues)
}

/// Numeric issues descending, then anything non-numeric in reverse text order.
pub fn sort_issues_desc(issues: &mut [String]) {
    issues.sort_by(|a, b| {
        let key = |s: &str| s.trim().parse::<u64>().ok();
        match (key(a), key(b)) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.cmp(a),
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueRegistration {
    Registered,
    AlreadyRegistered,
}

pub fn register_issue(conn: &Connection, number: &str) -> Result<IssueRegistration> {
    let number = number.trim();
    if number.is_empty() {
        bail!("issue number is empty");
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO gazette_issues (issue_number) VALUES (?1)",
        [number],
    )?;
    Ok(if inserted == 1 {
        IssueRegistration::Registered
    } else {
        IssueRegistration::AlreadyRegistered
    })
}

pub fn list_registered_issues(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT issue_number FROM gazette_issues")?;
    let mut issues = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    sort_issues_desc(&mut issues);
    Ok(issues)
}

pub fn is_issue_registered(conn: &Connection, number: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM gazette_issues WHERE issue_number = ?1",
            [number.trim()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

// ── Verification ──

/// Manual follow-up on whether a granted mark is actually in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Verification {
    Unset,
    NotInUse,
    InUse,
}

impl Verification {
    /// Stored text; `None` clears the column.
    pub fn as_db(self) -> Option<&'static str> {
        match self {
            Verification::Unset => None,
            Verification::NotInUse => Some("marca não sendo utilizada"),
            Verification::InUse => Some("marca sendo utilizada"),
        }
    }
}

/// Tag every stored record of `process`. Returns the number of rows touched.
pub fn set_verification(conn: &Connection, process: &str, verification: Verification) -> Result<usize> {
    let n = conn.execute(
        "UPDATE trademark_records SET verification = ?1 WHERE process = ?2",
        rusqlite::params![verification.as_db(), process.trim()],
    )?;
    Ok(n)
}

#[derive(Debug, Clone, Default)]
pub struct VerificationTally {
    pub updated: usize,
    /// Processes with no stored record.
    pub unknown: Vec<String>,
    pub errors: Vec<RowError>,
}

pub fn set_verifications(conn: &Connection, pairs: &[(String, Verification)]) -> VerificationTally {
    let mut tally = VerificationTally::default();
    for (process, verification) in pairs {
        match set_verification(conn, process, *verification) {
            Ok(0) => tally.unknown.push(process.clone()),
            Ok(_) => tally.updated += 1,
            Err(e) => tally.errors.push(RowError {
                process: Some(process.clone()),
                message: format!("{:#}", e),
            }),
        }
    }
    tally
}

// ── Stats ──

pub struct Stats {
    pub total_records: usize,
    pub unique_processes: usize,
    pub unique_classes: usize,
    pub issues: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let total_records: usize = conn.query_row("SELECT COUNT(*) FROM trademark_records", [], |r| r.get(0))?;
    let unique_processes: usize =
        conn.query_row("SELECT COUNT(DISTINCT process) FROM trademark_records", [], |r| r.get(0))?;
    let unique_classes: usize =
        conn.query_row("SELECT COUNT(DISTINCT class) FROM trademark_records", [], |r| r.get(0))?;
    let issues: usize = conn.query_row("SELECT COUNT(*) FROM gazette_issues", [], |r| r.get(0))?;
    Ok(Stats {
        total_records,
        unique_processes,
        unique_classes,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::table::GrantedRecord;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn record(process: &str, mark: &str, class: &str, issue: &str) -> StoredRecord {
        StoredRecord {
            process: Some(process.into()),
            mark: Some(mark.into()),
            class: Some(class.into()),
            specification: None,
            holder: Some("ACME LTDA".into()),
            status: DEFAULT_STATUS.into(),
            issue_number: Some(issue.into()),
        }
    }

    #[test]
    fn connect_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/gazette.sqlite");
        let conn = connect(&path).unwrap();
        init_schema(&conn).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn from_table_maps_canonical_columns() {
        let table = RecordTable::from_records(vec![GrantedRecord {
            process_number: "901".into(),
            mark_name: "ACME".into(),
            class_code: "8".into(),
            holder_name: "ACME LTDA".into(),
            agent_name: String::new(),
            grant_date: "25/06/2024".into(),
            class_status: "Deferida".into(),
            specification_text: "Ferramentas".into(),
            specification_translation: "Tools".into(),
        }]);
        let rows = StoredRecord::from_table(&table, Some(" 2790 "));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].process.as_deref(), Some("901"));
        assert_eq!(rows[0].specification.as_deref(), Some("Ferramentas"));
        assert_eq!(rows[0].status, "Deferida");
        assert_eq!(rows[0].issue_number.as_deref(), Some("2790"));
    }

    #[test]
    fn from_table_defaults_status() {
        let mut table = RecordTable::new(vec![PROCESS_NUMBER.into(), "Especificacao".into()]);
        table.push_row(vec![Some("1".into()), None]);
        let rows = StoredRecord::from_table(&table, None);
        assert_eq!(rows[0].status, DEFAULT_STATUS);
        assert_eq!(rows[0].mark, None);
        assert_eq!(rows[0].issue_number, None);
    }

    #[test]
    fn append_skips_duplicates() {
        let conn = memory();
        let rows = vec![record("1", "A", "8", "2790"), record("1", "A", "9", "2790")];
        let first = append_records(&conn, &rows, 100).unwrap();
        assert_eq!(first.saved, 2);

        let again = vec![record("1", "A", "8", "2790"), record("2", "B", "8", "2790")];
        let second = append_records(&conn, &again, 100).unwrap();
        assert_eq!(second.total, 2);
        assert_eq!(second.saved, 1);
        assert_eq!(second.duplicates, 1);
        assert!(second.errors.is_empty());
    }

    #[test]
    fn null_columns_still_deduplicate() {
        let conn = memory();
        let mut row = record("1", "A", "8", "2790");
        row.class = None;
        row.issue_number = None;
        append_records(&conn, &[row.clone()], 10).unwrap();
        let report = append_records(&conn, &[row], 10).unwrap();
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn rejected_row_does_not_block_others() {
        let conn = memory();
        conn.execute_batch(
            "CREATE TRIGGER reject_blocked BEFORE INSERT ON trademark_records
             WHEN NEW.mark = 'BLOCKED'
             BEGIN SELECT RAISE(ABORT, 'mark is blocked'); END;",
        )
        .unwrap();

        let rows = vec![
            record("1", "A", "8", "1"),
            record("2", "BLOCKED", "8", "1"),
            record("3", "C", "8", "1"),
            record("4", "D", "8", "1"),
        ];
        let report = append_records(&conn, &rows, 3).unwrap();
        assert_eq!(report.saved, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].process.as_deref(), Some("2"));
        assert!(report.errors[0].message.contains("blocked"));

        let all = query_records(&conn, &RecordQuery::default(), 1000).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn query_filters_and_pages() {
        let conn = memory();
        let mut rows: Vec<StoredRecord> = (0..25).map(|i| record(&i.to_string(), "Acme", "8", "2790")).collect();
        rows.push(record("100", "100% Natural_Co", "3", "2791"));
        rows.push(record("101", "Outra", "3", "2791"));
        append_records(&conn, &rows, 10).unwrap();

        let all = query_records(&conn, &RecordQuery::default(), 7).unwrap();
        assert_eq!(all.len(), 27);
        // newest first
        assert_eq!(all[0].process.as_deref(), Some("101"));

        let limited = RecordQuery {
            limit: Some(12),
            ..Default::default()
        };
        assert_eq!(query_records(&conn, &limited, 5).unwrap().len(), 12);

        let by_class = RecordQuery {
            class: Some("03".into()),
            ..Default::default()
        };
        assert_eq!(query_records(&conn, &by_class, 1000).unwrap().len(), 2);

        let by_mark = RecordQuery {
            mark: Some("% natural_".into()),
            ..Default::default()
        };
        let found = query_records(&conn, &by_mark, 1000).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].process.as_deref(), Some("100"));

        let by_mark_ci = RecordQuery {
            mark: Some("ACM".into()),
            issue: Some("2790".into()),
            ..Default::default()
        };
        assert_eq!(query_records(&conn, &by_mark_ci, 1000).unwrap().len(), 25);
    }

    #[test]
    fn delete_and_list_issues() {
        let conn = memory();
        let rows = vec![
            record("1", "A", "8", "998"),
            record("2", "B", "8", "2790"),
            record("3", "C", "8", "2790"),
        ];
        append_records(&conn, &rows, 100).unwrap();
        assert_eq!(list_issue_numbers(&conn).unwrap(), vec!["2790", "998"]);

        assert_eq!(delete_issue_records(&conn, "2790").unwrap(), 2);
        assert_eq!(list_issue_numbers(&conn).unwrap(), vec!["998"]);
        assert_eq!(delete_issue_records(&conn, "2790").unwrap(), 0);
    }

    #[test]
    fn issue_registry() {
        let conn = memory();
        assert_eq!(register_issue(&conn, "2790").unwrap(), IssueRegistration::Registered);
        assert_eq!(register_issue(&conn, " 2790 ").unwrap(), IssueRegistration::AlreadyRegistered);
        register_issue(&conn, "2801").unwrap();
        assert!(register_issue(&conn, "  ").is_err());
        assert_eq!(list_registered_issues(&conn).unwrap(), vec!["2801", "2790"]);
        assert!(is_issue_registered(&conn, "2790").unwrap());
        assert!(!is_issue_registered(&conn, "1").unwrap());
    }

    #[test]
    fn issue_sort_order() {
        let mut issues: Vec<String> = ["99", "2790", "abc", "1000", "xyz"].iter().map(|s| s.to_string()).collect();
        sort_issues_desc(&mut issues);
        assert_eq!(issues, vec!["2790", "1000", "99", "xyz", "abc"]);
    }

    #[test]
    fn verification_updates_every_class_row() {
        let conn = memory();
        let rows = vec![record("1", "A", "8", "1"), record("1", "A", "9", "1"), record("2", "B", "8", "1")];
        append_records(&conn, &rows, 100).unwrap();

        assert_eq!(set_verification(&conn, "1", Verification::InUse).unwrap(), 2);
        let stored = query_records(&conn, &RecordQuery::default(), 100).unwrap();
        let tagged: Vec<_> = stored.iter().filter(|r| r.verification.is_some()).collect();
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged[0].verification.as_deref(), Some("marca sendo utilizada"));

        let tally = set_verifications(
            &conn,
            &[
                ("1".to_string(), Verification::Unset),
                ("2".to_string(), Verification::NotInUse),
                ("404".to_string(), Verification::InUse),
            ],
        );
        assert_eq!(tally.updated, 2);
        assert_eq!(tally.unknown, vec!["404"]);
        let stored = query_records(&conn, &RecordQuery::default(), 100).unwrap();
        let tagged: Vec<_> = stored.iter().filter_map(|r| r.verification.as_deref()).collect();
        assert_eq!(tagged, vec!["marca não sendo utilizada"]);
    }

    #[test]
    fn stats_counts() {
        let conn = memory();
        let rows = vec![record("1", "A", "8", "1"), record("1", "A", "9", "1"), record("2", "B", "8", "1")];
        append_records(&conn, &rows, 100).unwrap();
        register_issue(&conn, "1").unwrap();
        let s = get_stats(&conn).unwrap();
        assert_eq!(s.total_records, 3);
        assert_eq!(s.unique_processes, 2);
        assert_eq!(s.unique_classes, 2);
        assert_eq!(s.issues, 1);
    }
}
