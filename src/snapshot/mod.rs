//! Schema and data snapshots.

pub mod data;
pub mod schema;

pub use data::{capture_data, DataSnapshot, RowCountDecrease};
pub use schema::{
    capture_schema, ConstraintDef, ConstraintKind, IndexDef, SchemaDiff, SchemaSnapshot,
    TableColumn,
};
