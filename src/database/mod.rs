//! Database module
//!
//! This module provides all database functionality, organized into:
//!
//! - **core**: engine, connections, schema metadata and per-context storage
//! - **session**: units of work and the flush notifications they publish
//! - **manager**: the `Database` lifecycle manager tying both together
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/              # Foundation
//! │   ├── connection     # SQLite connection wrapper, result rows
//! │   ├── context        # per-thread value slots
//! │   ├── engine         # Engine, URL parsing, transaction tracker
//! │   └── schema         # Metadata, Table, Mapper
//! │
//! ├── session/           # Unit of work
//! │   ├── unit_of_work   # Session, SessionFactory
//! │   └── events         # FlushEvent, NotificationSink, FlushObservers
//! │
//! └── manager            # Database<D: DatabaseDefinition>
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use lead::database::{Column, Database, DatabaseDefinition, Metadata, Table, TableMap};
//! use std::sync::Arc;
//!
//! struct Inventory;
//!
//! impl DatabaseDefinition for Inventory {
//!     fn url(&self) -> Option<String> {
//!         Some("sqlite://memory".to_string())
//!     }
//!
//!     fn setup_tables(&self, metadata: &Arc<Metadata>, tables: &mut TableMap) -> anyhow::Result<()> {
//!         let items = Table::new("items", metadata, vec![
//!             Column::integer("id").primary_key(),
//!             Column::text("name").not_null(),
//!         ]);
//!         metadata.create_all()?;
//!         tables.insert("items".to_string(), items);
//!         Ok(())
//!     }
//! }
//!
//! let db = Database::new(Inventory);
//! let session = db.session()?;
//! ```

pub mod core;
mod error;
mod manager;
pub mod session;

pub use error::DatabaseError;
pub use manager::{Database, DatabaseDefinition, LifecycleState};

pub use self::core::{
    create_engine, Column, ColumnType, Connection, ConnectionSettings, ContextLocal, Engine,
    EngineUrl, Location, Mapped, Mapper, MapperMap, Metadata, Row, Strategy, Table, TableMap,
    TransactionTracker,
};

pub use session::{
    FlushEvent, FlushEventKind, FlushObservers, NotificationSink, PendingChange, Session,
    SessionFactory, SessionOptions, TracingSink,
};
