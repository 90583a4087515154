//! Row and schema data model
//!
//! Rows are fixed-length positional arrays of [`SqlValue`]. A [`RowSchema`]
//! carries the ordered column metadata of one relation or query result,
//! including the key-column subset that identifies a row within a result set.
//! Change batches arriving from the transport are decoded against the schema
//! into typed [`RowChangeBatch`] values.

mod schema;


pub use schema::Column;
pub use schema::ColumnType;
pub use schema::RowSchema;

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use nanoid::nanoid;

/// Identity of a relation (base table or view) in the remote store,
/// qualified by its schema name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId {
    pub schema: String,
    pub name: String,
}

impl RelationId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// What kind of object a catalog reference points at. The dependency
/// resolver recurses into views and stops at base tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    BaseTable,
    View,
}

const QUERY_ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Identity of one opened query. Generated per open call and used to name
/// the remote ephemeral objects (view, shadow table) created for it, so the
/// alphabet is restricted to characters that are safe inside identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    pub fn generate() -> Self {
        Self(nanoid!(16, &QUERY_ID_ALPHABET))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One typed cell value.
///
/// Equality is NULL-aware (`Null == Null`) and floats compare by bit
/// pattern so values can participate in hashed row keys.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => true,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a == b,
            (SqlValue::Int(a), SqlValue::Int(b)) => a == b,
            (SqlValue::Float(a), SqlValue::Float(b)) => a.to_bits() == b.to_bits(),
            (SqlValue::Text(a), SqlValue::Text(b)) => a == b,
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SqlValue {}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            SqlValue::Null => state.write_u8(0),
            SqlValue::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            SqlValue::Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            SqlValue::Float(f) => {
                state.write_u8(3);
                f.to_bits().hash(state);
            }
            SqlValue::Text(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            SqlValue::Bytes(b) => {
                state.write_u8(5);
                b.hash(state);
            }
        }
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Parse the textual wire representation the transport delivers.
    /// `None` is a NULL regardless of column type.
    pub(crate) fn parse(ty: ColumnType, raw: Option<&str>) -> Result<Self, String> {
        let Some(text) = raw else {
            return Ok(SqlValue::Null);
        };
        match ty {
            ColumnType::Bool => match text {
                "0" | "false" => Ok(SqlValue::Bool(false)),
                "1" | "true" => Ok(SqlValue::Bool(true)),
                other => Err(format!("invalid bool literal '{other}'")),
            },
            ColumnType::Int => text
                .parse::<i64>()
                .map(SqlValue::Int)
                .map_err(|e| format!("invalid int literal '{text}': {e}")),
            ColumnType::Float => text
                .parse::<f64>()
                .map(SqlValue::Float)
                .map_err(|e| format!("invalid float literal '{text}': {e}")),
            ColumnType::Text => Ok(SqlValue::Text(text.to_string())),
            ColumnType::Bytes => parse_hex(text)
                .map(SqlValue::Bytes)
                .ok_or_else(|| format!("invalid hex literal '{text}'")),
        }
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    // Non-ASCII input must fail cleanly, not trip a char-boundary slice.
    if !text.is_ascii() || text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// A fixed-length positional row. Owns its values; equality is positional
/// and NULL-aware via [`SqlValue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

impl std::ops::Index<usize> for Row {
    type Output = SqlValue;

    fn index(&self, index: usize) -> &SqlValue {
        &self.values[index]
    }
}

/// The ordered projection of a row's key columns. Usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(pub Vec<SqlValue>);

/// Kind of mutation one change batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// A decoded change event for one base relation: the change kind plus the
/// affected rows, in arrival order. Batches are never split or merged.
#[derive(Debug, Clone)]
pub struct RowChangeBatch {
    pub kind: RowChangeKind,
    pub rows: Vec<Row>,
}

/// The (inserted, updated, deleted) row sets needed to move a materialized
/// state from its previous to its current version.
#[derive(Debug, Clone, Default)]
pub struct RowDiff {
    pub inserted: Vec<Row>,
    pub updated: Vec<Row>,
    pub deleted: Vec<Row>,
}

impl RowDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
