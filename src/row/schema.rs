use std::collections::HashMap;

use crate::errors::SetupError;
use crate::errors::TransportError;
use crate::store::RawChangeMessage;

use super::Row;
use super::RowChangeBatch;
use super::RowKey;
use super::SqlValue;

/// Storage type of one column, as reported by the schema catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered column metadata of one relation or query result.
///
/// Invariant: the key-column subset is a subsequence of the declared
/// columns, contains at least one column, and uniquely identifies a row
/// within one result set at any instant.
#[derive(Debug, Clone)]
pub struct RowSchema {
    columns: Vec<Column>,
    index_by_name: HashMap<String, usize>,
    key_indexes: Vec<usize>,
}

impl RowSchema {
    pub fn new(columns: Vec<Column>, key_columns: &[String]) -> Result<Self, SetupError> {
        let mut index_by_name = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if index_by_name.insert(column.name.clone(), i).is_some() {
                return Err(SetupError::DuplicateColumn {
                    column: column.name.clone(),
                });
            }
        }
        if key_columns.is_empty() {
            return Err(SetupError::NoKeyColumns);
        }
        let mut key_indexes = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            match index_by_name.get(name) {
                Some(&i) if !key_indexes.contains(&i) => {
                    // The key subset must be a subsequence of the declared
                    // columns, so indexes are strictly increasing.
                    if key_indexes.last().is_some_and(|&last| i < last) {
                        return Err(SetupError::KeyColumnOrder {
                            column: name.clone(),
                        });
                    }
                    key_indexes.push(i);
                }
                _ => {
                    return Err(SetupError::KeyColumnMissing {
                        column: name.clone(),
                    })
                }
            }
        }
        Ok(Self {
            columns,
            index_by_name,
            key_indexes,
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn key_indexes(&self) -> &[usize] {
        &self.key_indexes
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.key_indexes.iter().map(|&i| &self.columns[i])
    }

    /// Deterministically project the key columns of `row` into an ordered
    /// key tuple.
    pub fn key_of(&self, row: &Row) -> RowKey {
        RowKey(
            self.key_indexes
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(SqlValue::Null))
                .collect(),
        )
    }

    /// Decode a raw transport message into a typed change batch.
    ///
    /// Raw rows carry (column name, textual-or-null value) pairs; columns
    /// absent from a raw row decode as NULL. An unknown column name or an
    /// unparsable literal fails the whole batch.
    pub fn decode_batch(&self, message: &RawChangeMessage) -> Result<RowChangeBatch, TransportError> {
        let mut rows = Vec::with_capacity(message.rows.len());
        for raw_row in &message.rows {
            let mut values = vec![SqlValue::Null; self.columns.len()];
            for (name, raw_value) in raw_row {
                let index =
                    self.column_index(name)
                        .ok_or_else(|| TransportError::Decode {
                            relation: message.relation.clone(),
                            reason: format!("unknown column '{name}'"),
                        })?;
                values[index] = SqlValue::parse(self.columns[index].ty, raw_value.as_deref())
                    .map_err(|reason| TransportError::Decode {
                        relation: message.relation.clone(),
                        reason,
                    })?;
            }
            rows.push(Row::new(values));
        }
        Ok(RowChangeBatch {
            kind: message.kind,
            rows,
        })
    }
}
