//! Shared test fixtures: an in-memory store implementing all four
//! collaborator contracts, plus small row/schema builders.

mod fake_store;

pub use fake_store::FakeStore;

use crate::row::Column;
use crate::row::ColumnType;
use crate::row::Row;
use crate::row::SqlValue;

pub fn int_col(name: &str) -> Column {
    Column {
        name: name.to_string(),
        ty: ColumnType::Int,
    }
}

pub fn text_col(name: &str) -> Column {
    Column {
        name: name.to_string(),
        ty: ColumnType::Text,
    }
}

pub fn row_it(id: i64, text: &str) -> Row {
    Row::new(vec![SqlValue::Int(id), SqlValue::Text(text.to_string())])
}
