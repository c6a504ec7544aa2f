use std::collections::HashSet;

use itertools::Itertools;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::parser::class::{normalize_cell, normalize_class};
use crate::parser::table::RecordTable;

/// Requested classes and keywords. An empty list disables that filter.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub classes: Vec<String>,
    pub keywords: Vec<String>,
}

impl FilterOptions {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.keywords.is_empty()
    }
}

// ── Class filter ──

/// Keep rows whose class, once normalized, is one of `classes`.
///
/// Returns the input unchanged when the column is missing or when no
/// requested token survives normalization.
pub fn filter_by_classes(table: &RecordTable, classes: &[String], column: Option<&str>) -> RecordTable {
    let Some(idx) = column.and_then(|c| table.column_index(c)) else {
        return table.clone();
    };
    if classes.is_empty() || table.is_empty() {
        return table.clone();
    }

    let wanted: HashSet<String> = classes.iter().filter_map(|c| normalize_class(c)).collect();
    if wanted.is_empty() {
        debug!("no requested class survived normalization, class filter skipped");
        return table.clone();
    }

    table.filtered(|row| normalize_cell(row[idx].as_deref()).is_some_and(|c| wanted.contains(&c)))
}

// ── Keyword filter ──

/// One case-insensitive alternation of the literal keywords; `None` when no
/// keyword is left after trimming.
pub fn keyword_pattern(keywords: &[String]) -> Option<Regex> {
    let parts: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .map(|k| regex::escape(&k))
        .collect();
    if parts.is_empty() {
        return None;
    }
    // escaped literals always compile
    RegexBuilder::new(&parts.join("|")).case_insensitive(true).build().ok()
}

/// Keep rows whose specification contains any keyword.
pub fn filter_by_keywords(table: &RecordTable, keywords: &[String], column: Option<&str>) -> RecordTable {
    let Some(idx) = column.and_then(|c| table.column_index(c)) else {
        return table.clone();
    };
    if table.is_empty() {
        return table.clone();
    }
    let Some(pattern) = keyword_pattern(keywords) else {
        return table.clone();
    };
    table.filtered(|row| pattern.is_match(row[idx].as_deref().unwrap_or("")))
}

// ── Combined ──

/// Class filter, then keyword filter.
pub fn filter_records(
    table: &RecordTable,
    opts: &FilterOptions,
    class_column: Option<&str>,
    spec_column: Option<&str>,
) -> RecordTable {
    filter_records_with(table, opts, class_column, |t| {
        filter_by_keywords(t, &opts.keywords, spec_column)
    })
}

fn filter_records_with<F>(
    table: &RecordTable,
    opts: &FilterOptions,
    class_column: Option<&str>,
    keyword_step: F,
) -> RecordTable
where
    F: FnOnce(&RecordTable) -> RecordTable,
{
    if table.is_empty() {
        return table.clone();
    }

    let mut current = table.clone();
    if !opts.classes.is_empty() {
        current = filter_by_classes(&current, &opts.classes, class_column);
        debug!(before = table.len(), after = current.len(), "class filter");
        if current.is_empty() {
            return current;
        }
    }

    if !opts.keywords.is_empty() {
        let before = current.len();
        current = keyword_step(&current);
        debug!(before, after = current.len(), "keyword filter");
    }
    current
}

/// Row count per normalized class, ordered by class number. Rows with no
/// class are left out.
pub fn class_counts(table: &RecordTable, column: &str) -> Vec<(String, usize)> {
    let Some(idx) = table.column_index(column) else {
        return Vec::new();
    };
    table
        .rows()
        .iter()
        .filter_map(|row| normalize_cell(row[idx].as_deref()))
        .counts()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| class_order(a).cmp(&class_order(b)))
        .collect()
}

// Numeric classes first in numeric order, then the rest alphabetically.
fn class_order(class: &str) -> (u8, u64, &str) {
    match class.parse::<u64>() {
        Ok(n) => (0, n, ""),
        Err(_) => (1, 0, class),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const CLASS: &str = "class_code";
    const SPEC: &str = "specification_text";

    fn table(rows: &[(Option<&str>, Option<&str>)]) -> RecordTable {
        let mut t = RecordTable::new(vec!["process_number".into(), CLASS.into(), SPEC.into()]);
        for (i, (class, spec)) in rows.iter().enumerate() {
            t.push_row(vec![
                Some(i.to_string()),
                class.map(str::to_string),
                spec.map(str::to_string),
            ]);
        }
        t
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn processes(t: &RecordTable) -> Vec<&str> {
        (0..t.len()).map(|r| t.value(r, 0).unwrap()).collect()
    }

    fn sample() -> RecordTable {
        table(&[
            (Some("08"), Some("Ferramentas manuais")),
            (Some("Classe 3"), Some("Sabonetes")),
            (Some("N/A"), Some("")),
            (None, None),
            (Some("8"), Some("Alicates")),
            (Some("Cl. 99"), Some("Diversos")),
        ])
    }

    #[test]
    fn empty_filters_pass_through() {
        let t = sample();
        let out = filter_records(&t, &FilterOptions::default(), Some(CLASS), Some(SPEC));
        assert_eq!(out, t);
    }

    #[test]
    fn class_filter_normalizes_both_sides() {
        let out = filter_by_classes(&sample(), &strings(&["8", "03"]), Some(CLASS));
        assert_eq!(processes(&out), vec!["0", "1", "4"]);
        // rows keep their original values
        assert_eq!(out.value(0, 1), Some("08"));
    }

    #[test]
    fn class_filter_matches_unnormalizable_tokens_textually() {
        let out = filter_by_classes(&sample(), &strings(&["Cl. 99"]), Some(CLASS));
        assert_eq!(processes(&out), vec!["5"]);
    }

    #[test]
    fn class_filter_fails_open() {
        let t = sample();
        assert_eq!(filter_by_classes(&t, &strings(&["N/A", " ", "nan"]), Some(CLASS)), t);
        assert_eq!(filter_by_classes(&t, &strings(&["8"]), Some("missing")), t);
        assert_eq!(filter_by_classes(&t, &strings(&["8"]), None), t);
    }

    #[test]
    fn keyword_is_case_insensitive_substring() {
        let t = table(&[(Some("8"), Some("Ferramentas manuais")), (Some("8"), Some("Parafusos"))]);
        let out = filter_by_keywords(&t, &strings(&["FERRAMENTAS"]), Some(SPEC));
        assert_eq!(processes(&out), vec!["0"]);

        let out = filter_by_keywords(&t, &strings(&["ferramentas"]), Some(SPEC));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn keywords_are_literal() {
        let t = table(&[(None, Some("a.b")), (None, Some("axb")), (None, Some("(c)"))]);
        assert_eq!(processes(&filter_by_keywords(&t, &strings(&["a.b"]), Some(SPEC))), vec!["0"]);
        assert_eq!(processes(&filter_by_keywords(&t, &strings(&["(c"]), Some(SPEC))), vec!["2"]);
    }

    #[test]
    fn blank_keywords_pass_through() {
        let t = sample();
        assert_eq!(filter_by_keywords(&t, &strings(&["", "  "]), Some(SPEC)), t);
        assert_eq!(filter_by_keywords(&t, &strings(&["x"]), None), t);
    }

    #[test]
    fn missing_specification_never_matches() {
        let t = table(&[(None, None), (None, Some("sabonete"))]);
        let out = filter_by_keywords(&t, &strings(&["sabonete"]), Some(SPEC));
        assert_eq!(processes(&out), vec!["1"]);
    }

    #[test]
    fn combined_applies_both() {
        let opts = FilterOptions {
            classes: strings(&["8"]),
            keywords: strings(&["alicate"]),
        };
        let out = filter_records(&sample(), &opts, Some(CLASS), Some(SPEC));
        assert_eq!(processes(&out), vec!["4"]);
    }

    #[test]
    fn keyword_step_skipped_when_classes_empty_out() {
        let calls = Cell::new(0);
        let opts = FilterOptions {
            classes: strings(&["45"]),
            keywords: strings(&["ferramentas"]),
        };
        let out = filter_records_with(&sample(), &opts, Some(CLASS), |t| {
            calls.set(calls.get() + 1);
            t.clone()
        });
        assert!(out.is_empty());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn keyword_step_runs_after_matching_classes() {
        let calls = Cell::new(0);
        let opts = FilterOptions {
            classes: strings(&["8"]),
            keywords: strings(&["x"]),
        };
        filter_records_with(&sample(), &opts, Some(CLASS), |t| {
            calls.set(calls.get() + 1);
            t.clone()
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn input_is_not_mutated() {
        let t = sample();
        let before = t.clone();
        let opts = FilterOptions {
            classes: strings(&["3"]),
            keywords: strings(&["sabonete"]),
        };
        let out = filter_records(&t, &opts, Some(CLASS), Some(SPEC));
        assert_eq!(out.len(), 1);
        assert_eq!(t, before);
    }

    #[test]
    fn counts_by_class() {
        let counts = class_counts(&sample(), CLASS);
        assert_eq!(
            counts,
            vec![
                ("3".to_string(), 1),
                ("8".to_string(), 2),
                ("Cl. 99".to_string(), 1),
            ]
        );
        assert!(class_counts(&sample(), "missing").is_empty());
    }
}
