//! Table change notifications delivered by the data layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl TableOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for TableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write to a table that may have made cached results stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table_name: String,
    pub operation: TableOperation,
    pub row_count: u64,
    pub timestamp: OffsetDateTime,
    /// Columns touched by the write, when the source knows them.
    #[serde(default)]
    pub affected_columns: Option<Vec<String>>,
}

impl TableChange {
    pub fn new(table_name: impl Into<String>, operation: TableOperation, row_count: u64) -> Self {
        Self {
            table_name: table_name.into(),
            operation,
            row_count,
            timestamp: OffsetDateTime::now_utc(),
            affected_columns: None,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Lowercased table name, as stored in entries and the registry.
    pub fn normalized_table(&self) -> String {
        self.table_name.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_columns() {
        let change = TableChange::new("Users", TableOperation::Update, 3).with_columns(["email"]);
        assert_eq!(change.affected_columns, Some(vec!["email".to_string()]));
        assert_eq!(change.normalized_table(), "users");
    }

    #[test]
    fn operation_serializes_uppercase() {
        let encoded = serde_json::to_string(&TableOperation::Truncate).expect("serializes");
        assert_eq!(encoded, "\"TRUNCATE\"");
        assert_eq!(TableOperation::Insert.to_string(), "INSERT");
    }

    #[test]
    fn change_deserializes_without_columns() {
        let original = TableChange::new("orders", TableOperation::Delete, 2);
        let mut encoded = serde_json::to_value(&original).expect("change serializes");
        if let Some(object) = encoded.as_object_mut() {
            object.remove("affected_columns");
        }

        let decoded: TableChange = serde_json::from_value(encoded).expect("change deserializes");
        assert_eq!(decoded, original);
    }
}
