use anyhow::{anyhow, Result};
use config::Config;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::database::DatabaseError;

/// Property key selecting how connections are handed out per execution context
pub const STRATEGY_KEY: &str = "strategy";

/// Property key controlling text decoding of result rows
pub const CONVERT_UNICODE_KEY: &str = "convert_unicode";

/// Strategy used when the configuration does not name one
pub const DEFAULT_STRATEGY: &str = "threadlocal";

/// `convert_unicode` value used when the configuration does not set one
pub const DEFAULT_CONVERT_UNICODE: bool = true;

const EMPTY_CONFIG: &str = r#"### lead configuration file

### connection string, e.g. "sqlite://memory" or "sqlite:///var/lib/app/app.sqlite3"
# url = "sqlite://memory"

### engine properties
# [engine]
# strategy = "threadlocal"      # or "plain"
# convert_unicode = true
# echo = false
# journal_mode = "WAL"
# synchronous = "NORMAL"
# foreign_keys = true
# busy_timeout_ms = 5000
"#;

/// Engine configuration options
///
/// An ordered map of property name to JSON value. Keys the engine does not
/// recognize are carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct EngineProperties {
    values: BTreeMap<String, Value>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, returning the previous value if there was one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    /// Builder-style variant of [`EngineProperties::insert`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Copy of these properties with `strategy` and `convert_unicode` filled in
    ///
    /// Values already present are never overridden.
    pub fn with_defaults(&self) -> Self {
        let mut merged = self.clone();
        merged
            .values
            .entry(STRATEGY_KEY.to_string())
            .or_insert_with(|| Value::from(DEFAULT_STRATEGY));
        merged
            .values
            .entry(CONVERT_UNICODE_KEY.to_string())
            .or_insert(Value::Bool(DEFAULT_CONVERT_UNICODE));
        merged
    }

    /// Read a string property
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(invalid_property(key, "a string", other)),
        }
    }

    /// Read a boolean property
    ///
    /// Strings such as `"true"` or `"0"` are accepted, since environment
    /// overrides arrive as text.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) if n.as_i64() == Some(0) => Ok(Some(false)),
            Some(Value::Number(n)) if n.as_i64() == Some(1) => Ok(Some(true)),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(invalid_property(key, "a boolean", &Value::String(s.clone()))),
            },
            Some(other) => Err(invalid_property(key, "a boolean", other)),
        }
    }

    /// Read an integer property
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid_property(key, "an integer", &Value::Number(n.clone()))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid_property(key, "an integer", &Value::String(s.clone()))),
            Some(other) => Err(invalid_property(key, "an integer", other)),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for EngineProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn invalid_property(key: &str, expected: &str, found: &Value) -> anyhow::Error {
    DatabaseError::Configuration(format!(
        "engine property '{}' must be {}, found {}",
        key, expected, found
    ))
    .into()
}

/// Connection configuration for one logical database
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string; engine creation fails while this is unset
    #[serde(default)]
    pub url: Option<String>,

    /// Options handed to the engine
    #[serde(default)]
    pub engine: EngineProperties,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            engine: EngineProperties::default(),
        }
    }

    /// Builder-style engine property setter
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.engine.insert(key, value);
        self
    }

    /// Load configuration from a TOML file and the environment
    ///
    /// Sources, in increasing priority:
    /// 1. `path` if given, otherwise `$HOME/.lead/lead.toml` when it exists.
    ///    A missing explicit `path` is created from a commented template.
    /// 2. A `.env` file in the working directory (via dotenvy).
    /// 3. `LEAD_*` environment variables, e.g. `LEAD_URL=sqlite://memory` or
    ///    `LEAD_ENGINE__STRATEGY=plain`.
    pub fn load(path: Option<&str>) -> Result<DatabaseConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p);
                if path.exists() {
                    builder = builder.add_source(config::File::from(path.to_path_buf()));
                } else {
                    std::fs::write(path, EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file {}: {}", p, e))?;
                }
            }
            None => {
                if let Some(default_path) = Self::default_file_path() {
                    if default_path.exists() {
                        builder = builder.add_source(config::File::from(default_path));
                    }
                }
            }
        }

        // A missing .env file is not an error
        dotenvy::dotenv().ok();

        builder = builder.add_source(
            config::Environment::with_prefix("LEAD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        settings
            .try_deserialize::<DatabaseConfig>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))
    }

    /// Default configuration file location, `$HOME/.lead/lead.toml`
    pub fn default_file_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lead").join("lead.toml"))
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "URL:                {}",
            self.url.as_deref().unwrap_or("<unset>")
        )];

        for (key, value) in self.engine.with_defaults().iter() {
            lines.push(format!("{:<20}{}", format!("{}:", key), value));
        }

        lines.join("\n")
    }
}
