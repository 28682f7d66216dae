#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lead - lazily initialized database engines with per-context sessions
//!
//! Lead manages the lifecycle of one logical database: the SQLite engine is
//! built on first use, tables and mappers are defined once, and every
//! execution context (thread) transparently gets its own session with an
//! active transaction. Sessions publish notifications around every flush so
//! collaborators such as audit logs or cache invalidators can react.
//!
//! # Architecture
//!
//! - **[`database`]**: all database functionality
//!   - `core`: engine, connections, schema metadata
//!   - `session`: units of work and flush notifications
//!   - `Database`: the lifecycle manager
//!
//! - **[`config`]**: Configuration management
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lead::Database;
//!
//! let db = Database::new(MyDefinition::new());
//!
//! db.on_flush(|event| {
//!     println!("{} on session {}", event.kind(), event.session().id());
//! });
//!
//! let session = db.session()?;
//! session.add(&Item { id: 1, name: "widget".into() })?;
//! session.commit()?;
//!
//! // Same context, same session
//! assert!(std::rc::Rc::ptr_eq(&session, &db.session()?));
//! ```
//!
//! ## Reconfiguring at runtime
//!
//! ```rust,ignore
//! definition.set_url("sqlite:///var/lib/app/app.sqlite3");
//! db.invalidate()?;
//! // Tables keep their identity and are rebound to the new engine;
//! // sessions from the old engine are replaced on next access.
//! ```

pub mod config;
pub mod database;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{DatabaseConfig, EngineProperties};

// =============================================================================
// Database Module - Re-export commonly used types
// =============================================================================

// Lifecycle manager
pub use database::{Database, DatabaseDefinition, DatabaseError, LifecycleState};

// Core types
pub use database::{
    create_engine, Column, ColumnType, Connection, Engine, Mapped, Mapper, MapperMap, Metadata,
    Row, Strategy, Table, TableMap,
};

// SQLite value type used for row values and parameters
pub use rusqlite::types::Value;

// Sessions and flush notifications
pub use database::{
    FlushEvent, FlushEventKind, FlushObservers, NotificationSink, Session, SessionOptions,
    TracingSink,
};
