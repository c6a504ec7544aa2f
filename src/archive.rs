use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{self, IssueRegistration};
use crate::parser::gazette::issue_number;
use crate::parser::tree::{parse_document, NodeKind};

/// Directory of raw gazette documents, one file per document.
pub struct Archive {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl Archive {
    pub fn open(root: impl Into<PathBuf>) -> Result<Archive> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("Failed to create archive {:?}", root))?;
        Ok(Archive { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if !is_plain_name(name) {
            bail!("invalid document name {:?}", name);
        }
        Ok(self.root.join(name))
    }

    /// Store a new document. Existing names are never overwritten.
    pub fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        if path.exists() {
            bail!("{} is already archived", name);
        }
        fs::write(&path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// All documents, highest name first.
    pub fn list(&self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).with_context(|| format!("Failed to read {:?}", self.root))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            entries.push(ArchiveEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    pub fn download(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(bytes))
    }

    /// Returns false when there was nothing to delete.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to delete {:?}", path))?;
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.is_file()).unwrap_or(false)
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|n| n == name)
}

pub fn issue_file_name(issue: &str) -> String {
    format!("revista_{}.xml", issue)
}

#[derive(Debug, Clone)]
pub struct ArchiveReceipt {
    pub name: String,
    pub issue: Option<String>,
    /// Set when the upload succeeded but the issue could not be registered.
    pub warning: Option<String>,
}

/// Archive a document. A gazette whose root carries an issue number is stored
/// as `revista_<n>.xml` and its issue is registered in the store.
pub fn archive_document(archive: &Archive, conn: &Connection, file_name: &str, bytes: &[u8]) -> Result<ArchiveReceipt> {
    let issue = parse_document(bytes)
        .ok()
        .filter(|root| root.kind == NodeKind::Root)
        .and_then(|root| issue_number(&root));
    let name = issue.as_deref().map(issue_file_name).unwrap_or_else(|| file_name.to_string());

    archive.upload(&name, bytes)?;
    info!(document = %name, issue = ?issue, "archived");

    let warning = match issue.as_deref() {
        Some(number) => match db::register_issue(conn, number) {
            Ok(IssueRegistration::Registered | IssueRegistration::AlreadyRegistered) => None,
            Err(e) => {
                warn!(issue = number, error = %e, "archived without registering issue");
                Some(format!("issue {} was not registered: {:#}", number, e))
            }
        },
        None => None,
    };

    Ok(ArchiveReceipt { name, issue, warning })
}

/// Archived names plus `revista_<n>.xml` for registered issues that have no
/// archived file, highest name first.
pub fn available_documents(archive: &Archive, conn: &Connection) -> Result<Vec<String>> {
    let mut names: Vec<String> = archive.list()?.into_iter().map(|e| e.name).collect();
    for issue in db::list_registered_issues(conn)? {
        let name = issue_file_name(&issue);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}
