//! Heuristic table extraction from SQL text.
//!
//! Only used to tag entries for invalidation. CTE names, subqueries and
//! quoted identifiers are not understood; pass explicit tables to `set` when
//! the tagging has to be exact.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

// FROM / JOIN / UPDATE / INTO cover SELECT, INSERT INTO, DELETE FROM and UPDATE.
static TABLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:from|join|update|into)\s+(?:[a-z_][a-z0-9_$]*\.)?([a-z_][a-z0-9_$]*)")
        .expect("table reference pattern is valid")
});

// Keywords the pattern can land on, e.g. `ON CONFLICT DO UPDATE SET`.
const NOT_TABLES: &[&str] = &["set", "select", "lateral", "only"];

/// Lowercased, deduplicated table names referenced by `query`.
pub fn extract_tables(query: &str) -> BTreeSet<String> {
    TABLE_REFERENCE
        .captures_iter(query)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str().to_lowercase())
        .filter(|name| !NOT_TABLES.contains(&name.as_str()))
        .collect()
}

/// Lowercase and deduplicate caller-supplied table names.
pub fn normalize_tables<I, S>(tables: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tables
        .into_iter()
        .map(|table| table.as_ref().trim().to_lowercase())
        .filter(|table| !table.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(query: &str) -> Vec<String> {
        extract_tables(query).into_iter().collect()
    }

    #[test]
    fn select_with_join() {
        let tables = names(
            "SELECT w.title, e.user_id FROM Workshops w \
             INNER JOIN enrollments e ON e.workshop_id = w.id",
        );
        assert_eq!(tables, vec!["enrollments", "workshops"]);
    }

    #[test]
    fn write_statements() {
        assert_eq!(names("INSERT INTO answers (id) VALUES ($1)"), vec!["answers"]);
        assert_eq!(names("update Questionnaires set title = $1"), vec!["questionnaires"]);
        assert_eq!(names("DELETE FROM enrollments WHERE id = $1"), vec!["enrollments"]);
    }

    #[test]
    fn duplicates_collapse() {
        let tables = names("select * from users u join users m on u.manager_id = m.id");
        assert_eq!(tables, vec!["users"]);
    }

    #[test]
    fn schema_qualified_uses_table_segment() {
        assert_eq!(names("select * from public.workshops"), vec!["workshops"]);
    }

    #[test]
    fn upsert_does_not_tag_set_keyword() {
        let tables = names(
            "INSERT INTO answers (id, body) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET body = excluded.body",
        );
        assert_eq!(tables, vec!["answers"]);
    }

    #[test]
    fn no_tables_in_plain_expression() {
        assert!(extract_tables("select 1").is_empty());
        assert!(extract_tables("").is_empty());
    }

    #[test]
    fn explicit_tables_are_normalized() {
        let tables = normalize_tables(["Users", " users ", "", "ORDERS"]);
        assert_eq!(
            tables.into_iter().collect::<Vec<_>>(),
            vec!["orders".to_string(), "users".to_string()]
        );
    }
}
