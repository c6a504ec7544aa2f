use std::sync::LazyLock;

use regex::Regex;

use super::table::RecordTable;

static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// Tokens that stand for "no class" in gazette exports and spreadsheets.
const EMPTY_TOKENS: &[&str] = &["n/a", "nan", "none"];

pub const MIN_NICE_CLASS: u32 = 1;
pub const MAX_NICE_CLASS: u32 = 45;

/// Canonicalize a raw Nice class token ("03", "Classe 5", "Cl. 42") to a bare
/// number. Tokens without a usable number come back trimmed but unchanged;
/// blank or placeholder tokens yield `None`.
pub fn normalize_class(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || EMPTY_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t)) {
        return None;
    }

    if value.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = value.trim_start_matches('0');
        return Some(if stripped.is_empty() { "0" } else { stripped }.to_string());
    }

    // Only the first digit run counts, even when it is out of range.
    let in_range = DIGIT_RUN_RE
        .find(value)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|n| (MIN_NICE_CLASS..=MAX_NICE_CLASS).contains(n));

    match in_range {
        Some(n) => Some(n.to_string()),
        None => Some(value.to_string()),
    }
}

pub fn normalize_cell(cell: Option<&str>) -> Option<String> {
    cell.and_then(normalize_class)
}

/// Rewrite a class column through [`normalize_class`].
pub fn normalize_column(table: &mut RecordTable, column: usize) {
    table.map_column(column, normalize_cell);
}
