//! Core database infrastructure
//!
//! This module provides the foundational database components:
//! - `Engine`: connection factory with per-context connections and transactions
//! - `Connection`: SQLite connection wrapper with configuration
//! - `Metadata`, `Table`, `Mapper`: schema description bound to an engine
//! - `ContextLocal`: per-thread slot storage used for caching

pub(crate) mod connection;
mod context;
mod engine;
mod schema;

pub use connection::{Connection, ConnectionSettings, Location, Row};
pub use context::ContextLocal;
pub use engine::{create_engine, Engine, EngineUrl, Strategy, TransactionTracker};
pub use schema::{Column, ColumnType, Mapped, Mapper, MapperMap, Metadata, Table, TableMap};
