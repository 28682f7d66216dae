//! Database error types
//!
//! Failures raised by this crate itself. Errors coming from SQLite are not
//! translated; they travel through `anyhow` with context attached and can be
//! recovered with `downcast_ref::<rusqlite::Error>()`.

/// Errors raised by the database lifecycle manager and its sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// Required configuration is missing or invalid
    Configuration(String),

    /// A required database definition hook was not provided
    NotImplemented(&'static str),

    /// A session was used after the engine it was created against was replaced
    StaleSession { session: u64, engine: u64 },

    /// No mapper is registered for the entity
    UnknownMapper(String),

    /// No table with this name is known
    UnknownTable(String),

    /// The table has no column with this name
    UnknownColumn { table: String, column: String },
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            DatabaseError::NotImplemented(hook) => {
                write!(f, "Database definition must implement {}", hook)
            }
            DatabaseError::StaleSession { session, engine } => write!(
                f,
                "Session {} belongs to engine {} which has been invalidated",
                session, engine
            ),
            DatabaseError::UnknownMapper(entity) => {
                write!(f, "No mapper registered for entity '{}'", entity)
            }
            DatabaseError::UnknownTable(table) => write!(f, "Unknown table '{}'", table),
            DatabaseError::UnknownColumn { table, column } => {
                write!(f, "Table '{}' has no column '{}'", table, column)
            }
        }
    }
}

impl std::error::Error for DatabaseError {}
