//! Schema metadata, table definitions and entity mappers
//!
//! [`Metadata`] describes the schema bound to one engine. [`Table`]s are
//! created against a metadata and can later be rebound to a new one in
//! place, so code holding an `Arc<Table>` keeps a valid handle across engine
//! re-initialization.

use anyhow::{Context, Result};
use rusqlite::types::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use super::connection::{quote_ident, Row};
use super::engine::Engine;
use crate::database::DatabaseError;

static NEXT_METADATA_ID: AtomicU64 = AtomicU64::new(1);

/// Table name to table handle
pub type TableMap = BTreeMap<String, Arc<Table>>;

/// Entity name to mapper
pub type MapperMap = BTreeMap<String, Mapper>;

/// Schema metadata bound to a single engine
pub struct Metadata {
    id: u64,
    engine: Arc<Engine>,
    tables: RwLock<Vec<Weak<Table>>>,
}

impl Metadata {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_METADATA_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            tables: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Tables currently bound to this metadata, in registration order
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables().iter().map(|t| t.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables().iter().any(|t| t.name() == name)
    }

    fn register(&self, table: &Arc<Table>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.retain(|t| t.strong_count() > 0 && !std::ptr::eq(t.as_ptr(), Arc::as_ptr(table)));
        tables.push(Arc::downgrade(table));
    }

    fn unregister(&self, table: &Table) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| t.strong_count() > 0 && !std::ptr::eq(t.as_ptr(), table));
    }

    /// Create every bound table that does not exist yet
    pub fn create_all(&self) -> Result<()> {
        let conn = self.engine.contextual_connect()?;
        for table in self.tables() {
            conn.execute(&table.create_sql())
                .with_context(|| format!("Failed to create table {}", table.name()))?;
        }
        Ok(())
    }

    /// Create the bound tables the database does not have yet
    ///
    /// Returns the number of tables created.
    pub fn create_missing(&self) -> Result<usize> {
        let conn = self.engine.contextual_connect()?;
        let mut created = 0;
        for table in self.tables() {
            if !conn.table_exists(table.name())? {
                conn.execute(&table.create_sql())
                    .with_context(|| format!("Failed to create table {}", table.name()))?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Drop every bound table, in reverse registration order
    pub fn drop_all(&self) -> Result<()> {
        let conn = self.engine.contextual_connect()?;
        for table in self.tables().iter().rev() {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table.name())))
                .with_context(|| format!("Failed to drop table {}", table.name()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("id", &self.id)
            .field("engine", &self.engine.id())
            .field("tables", &self.table_names())
            .finish()
    }
}

/// SQLite column affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: false,
            nullable: true,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn definition(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.kind.sql_type());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

/// Table definition bound to a [`Metadata`]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    metadata: RwLock<Arc<Metadata>>,
}

impl Table {
    /// Define a table and register it with `metadata`
    pub fn new(name: impl Into<String>, metadata: &Arc<Metadata>, columns: Vec<Column>) -> Arc<Self> {
        let table = Arc::new(Self {
            name: name.into(),
            columns,
            metadata: RwLock::new(metadata.clone()),
        });
        metadata.register(&table);
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Metadata this table is currently bound to
    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move this table to `metadata`, keeping its identity
    pub fn rebind(self: &Arc<Self>, metadata: &Arc<Metadata>) {
        let previous = {
            let mut bound = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *bound, metadata.clone())
        };
        if !Arc::ptr_eq(&previous, metadata) {
            previous.unregister(self);
        }
        metadata.register(self);
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(Column::definition).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            columns.join(", ")
        )
    }

    pub(crate) fn check_column(&self, column: &str) -> Result<()> {
        if self.column(column).is_none() {
            return Err(DatabaseError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("metadata", &self.metadata().id())
            .finish()
    }
}

/// Maps an entity name onto a table
#[derive(Debug, Clone)]
pub struct Mapper {
    entity: String,
    table: Arc<Table>,
}

impl Mapper {
    pub fn new(entity: impl Into<String>, table: &Arc<Table>) -> Self {
        Self {
            entity: entity.into(),
            table: table.clone(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }
}

/// A Rust type persisted through a registered [`Mapper`]
pub trait Mapped: Sized {
    /// Entity name the mapper is registered under
    const ENTITY: &'static str;

    /// Column values to insert for this entity
    fn to_values(&self) -> Vec<(String, Value)>;

    /// Rebuild an entity from a row of its table
    fn from_row(row: &Row) -> Result<Self>;
}
