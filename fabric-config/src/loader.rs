//! Layered configuration loading with typed accessors.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use toml::Value;
use toml::value::Table;
use tracing::debug;

use crate::paths::FabricPaths;

/// Environment variable prefix recognised by the loader.
///
/// `FABRIC_BIND_HOST=0.0.0.0` sets `bind_host`; nested keys use a double
/// underscore, so `FABRIC_REGISTRY__ENDPOINT` sets `registry.endpoint`.
pub const ENV_PREFIX: &str = "FABRIC_";

/// Keys the loader itself consumes rather than merging.
const RESERVED: &[&str] = &[
    "FABRIC_ROOT",
    "FABRIC_CONFIG_DIR",
    "FABRIC_LOGS_DIR",
    "FABRIC_DATA_DIR",
    "FABRIC_MODELS_DIR",
    "FABRIC_CACHE_DIR",
    "FABRIC_GROUP",
    "FABRIC_LOG",
];

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced while resolving paths or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key was absent from the merged view.
    #[error("missing required configuration key `{key}`")]
    Missing {
        /// The dotted key that was required.
        key: String,
    },
    /// A key was present but could not be coerced to the requested type.
    #[error("configuration key `{key}` is not {expected}")]
    WrongType {
        /// The dotted key.
        key: String,
        /// Description of the expected type.
        expected: &'static str,
    },
    /// A filesystem operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },
    /// A configuration document failed to parse.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the offending document.
        path: PathBuf,
        /// Underlying TOML error.
        source: Box<toml::de::Error>,
    },
    /// A command-line argument was malformed.
    #[error("malformed argument `{argument}`: expected --key=value")]
    BadArgument {
        /// The offending argument.
        argument: String,
    },
}

/// Read-only merged configuration snapshot for one process.
///
/// Snapshots are cheap to clone and never mutated in place; a reload
/// produces a new snapshot.
#[derive(Clone, Debug)]
pub struct Config {
    agent: String,
    values: Arc<Table>,
    sources: Arc<Vec<PathBuf>>,
}

impl Config {
    /// Returns the agent name this snapshot was loaded for.
    #[must_use]
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Returns the raw value at a dotted key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut current: Option<&Value> = None;
        let mut table: &Table = &self.values;
        for part in key.split('.') {
            let value = table.get(part)?;
            current = Some(value);
            match value {
                Value::Table(next) => table = next,
                _ => table = EMPTY.get_or_init(Table::new),
            }
        }
        current
    }

    /// Returns a string value.
    #[must_use]
    pub fn as_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Returns an integer value.
    #[must_use]
    pub fn as_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Integer(i) => Some(*i),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Returns a boolean value.
    #[must_use]
    pub fn as_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Boolean(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Returns a duration value.
    ///
    /// Accepts integers (seconds) or strings with `ms`, `s`, or `m`
    /// suffixes, e.g. `"250ms"`, `"10s"`, `"5m"`.
    #[must_use]
    pub fn as_duration(&self, key: &str) -> Option<Duration> {
        match self.get(key)? {
            Value::Integer(secs) if *secs >= 0 => {
                Some(Duration::from_secs(u64::try_from(*secs).ok()?))
            }
            Value::String(s) => parse_duration(s),
            _ => None,
        }
    }

    /// Returns the value at `key` or fails.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the key is absent.
    pub fn require(&self, key: &str) -> ConfigResult<&Value> {
        self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    /// Returns a required string value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when absent and
    /// [`ConfigError::WrongType`] when not a string.
    pub fn require_string(&self, key: &str) -> ConfigResult<String> {
        self.require(key)?;
        self.as_string(key).ok_or(ConfigError::WrongType {
            key: key.to_string(),
            expected: "a string",
        })
    }

    /// Returns a required integer value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when absent and
    /// [`ConfigError::WrongType`] when not an integer.
    pub fn require_int(&self, key: &str) -> ConfigResult<i64> {
        self.require(key)?;
        self.as_int(key).ok_or(ConfigError::WrongType {
            key: key.to_string(),
            expected: "an integer",
        })
    }

    /// Returns the document paths that contributed to this snapshot, in
    /// merge order. Used by the watcher.
    #[must_use]
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

static EMPTY: std::sync::OnceLock<Table> = std::sync::OnceLock::new();

/// Parses a human-friendly duration string.
#[must_use]
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

/// Builds merged [`Config`] snapshots from the documented source layers.
#[derive(Debug)]
pub struct ConfigLoader {
    paths: FabricPaths,
    defaults: Table,
    args: Vec<String>,
}

impl ConfigLoader {
    /// Creates a loader over the resolved directory layout.
    #[must_use]
    pub fn new(paths: FabricPaths) -> Self {
        Self {
            paths,
            defaults: builtin_defaults(),
            args: Vec::new(),
        }
    }

    /// Supplies command-line arguments (`--key=value`) as the final layer.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the built-in default layer.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Table) -> Self {
        self.defaults = defaults;
        self
    }

    /// Loads one merged snapshot for the named agent.
    ///
    /// Merge order, later overriding earlier: built-in defaults, the shared
    /// `machine.toml`, the group document named by `FABRIC_GROUP`, `FABRIC_*`
    /// environment variables, command-line arguments. Loading is idempotent:
    /// the same sources produce the same snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents,
    /// [`ConfigError::Io`] for unreadable ones, and
    /// [`ConfigError::BadArgument`] for malformed arguments.
    pub fn load(&self, agent_name: &str) -> ConfigResult<Config> {
        let mut merged = self.defaults.clone();
        let mut sources = Vec::new();

        let machine = self.paths.config_dir().join("machine.toml");
        if let Some(table) = read_document(&machine)? {
            merge_table(&mut merged, table);
            sources.push(machine);
        }

        if let Ok(group) = env::var("FABRIC_GROUP") {
            let doc = self
                .paths
                .config_dir()
                .join("groups")
                .join(format!("{group}.toml"));
            if let Some(table) = read_document(&doc)? {
                merge_table(&mut merged, table);
                sources.push(doc);
            }
        }

        merge_table(&mut merged, env_layer());
        merge_table(&mut merged, args_layer(&self.args)?);

        debug!(agent = agent_name, layers = sources.len() + 3, "configuration loaded");
        Ok(Config {
            agent: agent_name.to_string(),
            values: Arc::new(merged),
            sources: Arc::new(sources),
        })
    }

    /// Returns the directory layout behind this loader.
    #[must_use]
    pub fn paths(&self) -> &FabricPaths {
        &self.paths
    }
}

fn builtin_defaults() -> Table {
    let mut table = Table::new();
    table.insert("machine_id".into(), Value::String("local".into()));
    table.insert("bind_host".into(), Value::String("127.0.0.1".into()));
    table.insert("shutdown_grace".into(), Value::String("10s".into()));
    table.insert("send_timeout".into(), Value::String("5s".into()));
    table.insert("recv_timeout".into(), Value::String("10s".into()));
    table.insert("probe_timeout".into(), Value::String("2s".into()));
    table.insert("lookup_timeout".into(), Value::String("1s".into()));
    table
}

fn read_document(path: &Path) -> ConfigResult<Option<Table>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: Table = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    Ok(Some(table))
}

fn env_layer() -> Table {
    let mut layer = Table::new();
    for (key, value) in env::vars() {
        if !key.starts_with(ENV_PREFIX) || RESERVED.contains(&key.as_str()) {
            continue;
        }
        let dotted = key[ENV_PREFIX.len()..]
            .to_ascii_lowercase()
            .replace("__", ".");
        insert_dotted(&mut layer, &dotted, coerce_scalar(&value));
    }
    layer
}

fn args_layer(args: &[String]) -> ConfigResult<Table> {
    let mut layer = Table::new();
    for argument in args {
        let Some(rest) = argument.strip_prefix("--") else {
            return Err(ConfigError::BadArgument {
                argument: argument.clone(),
            });
        };
        let Some((key, value)) = rest.split_once('=') else {
            return Err(ConfigError::BadArgument {
                argument: argument.clone(),
            });
        };
        insert_dotted(&mut layer, &key.replace('-', "_"), coerce_scalar(value));
    }
    Ok(layer)
}

/// Best-effort typed coercion for scalar overrides.
fn coerce_scalar(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(raw.to_string())
}

fn insert_dotted(table: &mut Table, dotted: &str, value: Value) {
    let mut parts = dotted.split('.').collect::<Vec<_>>();
    let leaf = parts.pop().unwrap_or(dotted);
    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        let Value::Table(next) = entry else {
            unreachable!("entry replaced with table above");
        };
        current = next;
    }
    current.insert(leaf.to_string(), value);
}

fn merge_table(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_table(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_in(root: &Path) -> ConfigLoader {
        ConfigLoader::new(FabricPaths::rooted_at(root).expect("paths"))
    }

    fn snapshot_of(raw: &str) -> Config {
        Config {
            agent: "test".into(),
            values: Arc::new(toml::from_str(raw).expect("parse")),
            sources: Arc::new(Vec::new()),
        }
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = loader_in(dir.path());
        std::fs::write(
            loader.paths().config_dir().join("machine.toml"),
            "bind_host = \"0.0.0.0\"\nmachine_id = \"mainpc\"\n",
        )
        .expect("write");

        let config = loader.load("tester").expect("load");
        assert_eq!(config.as_string("bind_host").as_deref(), Some("0.0.0.0"));
        assert_eq!(config.as_string("machine_id").as_deref(), Some("mainpc"));
        // Defaults survive where no layer overrides.
        assert_eq!(config.as_duration("shutdown_grace"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn args_override_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = loader_in(dir.path()).with_args(["--bind-host=10.0.0.9"]);
        let config = loader.load("tester").expect("load");
        assert_eq!(config.as_string("bind_host").as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn malformed_argument_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = loader_in(dir.path()).with_args(["bind-host"]);
        assert!(matches!(
            loader.load("tester"),
            Err(ConfigError::BadArgument { .. })
        ));
    }

    #[test]
    fn dotted_keys_traverse_tables() {
        let config = snapshot_of("[registry]\nendpoint = \"tcp://10.0.0.2:7100\"\nttl = 30\n");
        assert_eq!(
            config.as_string("registry.endpoint").as_deref(),
            Some("tcp://10.0.0.2:7100")
        );
        assert_eq!(config.as_int("registry.ttl"), Some(30));
        assert!(config.get("registry.absent").is_none());
    }

    #[test]
    fn require_reports_missing_key() {
        let config = snapshot_of("present = 1\n");
        assert!(config.require("present").is_ok());
        let err = config.require("absent").expect_err("missing");
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn duration_coercions() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("fast"), None);

        let config = snapshot_of("grace = 30\nprobe = \"500ms\"\n");
        assert_eq!(config.as_duration("grace"), Some(Duration::from_secs(30)));
        assert_eq!(config.as_duration("probe"), Some(Duration::from_millis(500)));
    }
}
