//! Sessions and flush notifications
//!
//! - `unit_of_work`: `Session` and the `SessionFactory` that builds it
//! - `events`: flush events and the observers they are published to

mod events;
mod unit_of_work;

pub use events::{FlushEvent, FlushEventKind, FlushObservers, NotificationSink, TracingSink};
pub use unit_of_work::{PendingChange, Session, SessionFactory, SessionOptions};
