//! Walkthrough: define a database, watch flush events, reuse the context session.
//!
//! Run with `cargo run --example items`. Set `LEAD_URL` (or a config file via
//! the first argument) to point at a different database.

use std::sync::Arc;

use anyhow::Result;
use lead::{
    Column, Database, DatabaseConfig, DatabaseDefinition, EngineProperties, Mapped,
    Mapper, MapperMap, Metadata, Row, Table, TableMap, TracingSink, Value,
};
use tracing::{info, Level};

struct Inventory {
    config: DatabaseConfig,
}

impl DatabaseDefinition for Inventory {
    fn url(&self) -> Option<String> {
        self.config.url.clone()
    }

    fn engine_properties(&self) -> EngineProperties {
        self.config.engine.clone()
    }

    fn setup_tables(&self, metadata: &Arc<Metadata>, tables: &mut TableMap) -> Result<()> {
        let items = Table::new(
            "items",
            metadata,
            vec![Column::integer("id").primary_key(), Column::text("name").not_null()],
        );
        metadata.create_all()?;
        tables.insert("items".to_string(), items);
        Ok(())
    }

    fn setup_mappers(&self, tables: &TableMap, mappers: &mut MapperMap) -> Result<()> {
        if let Some(items) = tables.get("items") {
            mappers.insert("Item".to_string(), Mapper::new("Item", items));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Item {
    id: i64,
    name: String,
}

impl Mapped for Item {
    const ENTITY: &'static str = "Item";

    fn to_values(&self) -> Vec<(String, Value)> {
        vec![
            ("id".to_string(), Value::Integer(self.id)),
            ("name".to_string(), Value::Text(self.name.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Item {
            id: row.get_i64("id")?,
            name: row.get_string("name")?,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let path = std::env::args().nth(1);
    let mut config = DatabaseConfig::load(path.as_deref())?;
    if config.url.is_none() {
        config.url = Some("sqlite://memory".to_string());
    }
    println!("{}", config.summary());

    let db = Database::new(Inventory { config });
    db.subscribe(TracingSink);
    db.on_flush(|event| {
        println!("{} (session {})", event.kind(), event.session().id());
    });

    let session = db.session()?;
    session.add(&Item {
        id: 1,
        name: "widget".to_string(),
    })?;
    session.flush()?;

    let again = db.session()?;
    info!(same = std::rc::Rc::ptr_eq(&session, &again), "session reuse");
    for item in again.query::<Item>()? {
        println!("{:?}", item);
    }
    again.commit()?;

    Ok(())
}
