use super::table::{GrantedRecord, RecordTable};
use super::tree::{parse_document, Node, NodeKind};
use crate::error::ExtractError;

/// Dispatch code of "Concessão de registro" in the INPI gazette.
pub const DEFAULT_GRANT_CODE: &str = "IPAS158";

const GRANTED_MARKER: &str = "deferid";
const REFUSED_MARKER: &str = "indeferid";
const FALLBACK_STATUS: &str = "Concedido";
const NOT_AVAILABLE: &str = "N/A";

/// Fields shared by every class record of one granted process.
struct ProcessFields {
    number: String,
    grant_date: String,
    holder: String,
    mark: String,
    agent: String,
}

/// Extract one record per granted class of every granted process, plus the
/// issue number of the gazette when the document carries one.
pub fn extract(bytes: &[u8], grant_code: &str) -> Result<(RecordTable, Option<String>), ExtractError> {
    let root = parse_document(bytes)?;
    let issue = issue_number(&root);

    let mut records = Vec::new();
    for process in root.find_all(NodeKind::Process) {
        if !is_granted(process, grant_code) {
            continue;
        }
        records.extend(process_records(process));
    }

    tracing::debug!(records = records.len(), issue = ?issue, "extracted gazette records");
    Ok((RecordTable::from_records(records), issue))
}

pub fn issue_number(root: &Node) -> Option<String> {
    let revista = if root.kind == NodeKind::Root {
        Some(root)
    } else {
        root.find(NodeKind::Root)
    };
    revista
        .and_then(|n| n.attr("numero"))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

pub fn is_granted(process: &Node, grant_code: &str) -> bool {
    process
        .find_all(NodeKind::Dispatch)
        .any(|d| d.attr("codigo") == Some(grant_code))
}

/// "Deferida" and "Deferido" count, "Indeferido" does not.
pub fn is_granted_status(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    status.contains(GRANTED_MARKER) && !status.contains(REFUSED_MARKER)
}

fn process_fields(process: &Node) -> ProcessFields {
    let number = process.attr("numero").unwrap_or_default().trim().to_string();
    let grant_date = process
        .attr("data-concessao")
        .or_else(|| process.attr("data_concessao"))
        .unwrap_or_default()
        .to_string();

    let holder = process
        .find(NodeKind::Holder)
        .and_then(|h| {
            h.attr("nome-razao-social")
                .filter(|name| !name.trim().is_empty())
                .or_else(|| h.text())
        })
        .unwrap_or(NOT_AVAILABLE)
        .to_string();

    let mark = process
        .find_all(NodeKind::Mark)
        .find_map(|m| m.child(NodeKind::Name).and_then(Node::text))
        .or_else(|| process.find(NodeKind::Mark).and_then(Node::text))
        .unwrap_or(NOT_AVAILABLE)
        .to_string();

    let agent = process
        .find(NodeKind::Agent)
        .and_then(Node::text)
        .unwrap_or_default()
        .to_string();

    ProcessFields {
        number,
        grant_date,
        holder,
        mark,
        agent,
    }
}

fn process_records(process: &Node) -> Vec<GrantedRecord> {
    let fields = process_fields(process);

    let mut records: Vec<GrantedRecord> = process
        .find_all(NodeKind::Classification)
        .filter_map(|class| {
            let status = class.child(NodeKind::Status).and_then(Node::text)?;
            if !is_granted_status(status) {
                return None;
            }
            let child_text = |kind: NodeKind| class.child(kind).and_then(Node::text).unwrap_or_default().to_string();
            Some(GrantedRecord {
                process_number: fields.number.clone(),
                mark_name: fields.mark.clone(),
                class_code: class
                    .attr("codigo")
                    .filter(|c| !c.is_empty())
                    .unwrap_or(NOT_AVAILABLE)
                    .to_string(),
                holder_name: fields.holder.clone(),
                agent_name: fields.agent.clone(),
                grant_date: fields.grant_date.clone(),
                class_status: status.to_string(),
                specification_text: child_text(NodeKind::Specification),
                specification_translation: child_text(NodeKind::Translation),
            })
        })
        .collect();

    if records.is_empty() && !fields.number.is_empty() {
        records.push(GrantedRecord {
            process_number: fields.number,
            mark_name: fields.mark,
            class_code: NOT_AVAILABLE.to_string(),
            holder_name: fields.holder,
            agent_name: fields.agent,
            grant_date: fields.grant_date,
            class_status: FALLBACK_STATUS.to_string(),
            specification_text: String::new(),
            specification_translation: String::new(),
        });
    }
    records
}
