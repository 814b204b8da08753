//! Loads and validates the YAML configuration file (spec.md §6): general
//! options, per-bridge connection info, and per-collection index configs.
//! Validation is fatal at startup — a bad config never reaches a running
//! pipeline.

mod error;
mod raw;
pub mod settings;

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

pub use error::ConfigError;
use meilibridge_types::{
    CollectionRef,
    Pk,
    Projection,
};
use raw::{
    RawBridge,
    RawConfig,
    RawDatabase,
    RawIndexConfig,
};
pub use settings::IndexSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/meilibridge/config.yml";

/// The source engine kind a bridge talks to (spec.md §6). Only `Mongo` has a
/// concrete adapter in this workspace; `Mysql`/`Postgres` name the relational
/// path the specification calls out as interface-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Mongo,
    Mysql,
    Postgres,
}

impl Engine {
    fn parse(raw: &str, bridge: &str) -> Result<Self, ConfigError> {
        match raw {
            "mongo" => Ok(Engine::Mongo),
            "mysql" => Ok(Engine::Mysql),
            "postgres" => Ok(Engine::Postgres),
            other => Err(ConfigError::UnsupportedEngine {
                bridge: bridge.to_string(),
                engine: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Mongo => "mongo",
            Engine::Mysql => "mysql",
            Engine::Postgres => "postgres",
        }
    }

    /// Only the document-store engine participates in change capture
    /// (spec.md §1: "the relational engine is partially sketched for
    /// bulk-only use").
    pub fn supports_change_stream(&self) -> bool {
        matches!(self, Engine::Mongo)
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub custom_params: BTreeMap<String, String>,
}

/// A single collection/table's destination mapping (the value half of a
/// bridge's `index_map`, spec.md §6).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub index_name: String,
    pub primary_key: Pk,
    pub projection: Projection,
    pub settings: Option<IndexSettings>,
}

#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    pub meilisearch_api_url: String,
    pub meilisearch_api_key: Option<String>,
    pub database: Database,
    pub index_map: BTreeMap<CollectionRef, IndexConfig>,
}

#[derive(Debug, Clone)]
pub struct TriggerSync {
    pub listen: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Pprof {
    pub enable: bool,
    pub listen: Option<String>,
}

#[derive(Debug, Clone)]
pub struct General {
    pub auto_bulk_interval_secs: i64,
    pub pprof: Option<Pprof>,
    pub trigger_sync: Option<TriggerSync>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            auto_bulk_interval_secs: 1,
            pprof: None,
            trigger_sync: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub general: General,
    pub bridges: Vec<Bridge>,
}

impl Config {
    /// Reads and validates the config file at `path`, failing with a
    /// [`ConfigError`] on the first problem found (mirrors the original's
    /// single ordered `Validate()` pass).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&contents)?;
        Config::try_from(raw)
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let general = match raw.general {
            None => General::default(),
            Some(g) => {
                let auto_bulk_interval_secs = g.auto_bulk_interval.unwrap_or(1);
                if auto_bulk_interval_secs < 1 {
                    return Err(ConfigError::AutoBulkIntervalTooSmall(auto_bulk_interval_secs));
                }
                let pprof = g.pprof.map(|p| Pprof {
                    enable: p.enable,
                    listen: p.listen,
                });
                let trigger_sync = match g.trigger_sync {
                    None => None,
                    Some(t) => {
                        let listen = t.listen.ok_or(ConfigError::TriggerSyncListenRequired)?;
                        Some(TriggerSync {
                            listen,
                            token: t.token,
                        })
                    },
                };
                General {
                    auto_bulk_interval_secs,
                    pprof,
                    trigger_sync,
                }
            },
        };

        if raw.bridges.is_empty() {
            return Err(ConfigError::MissingBridges);
        }

        let bridges = raw
            .bridges
            .into_iter()
            .map(parse_bridge)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config { general, bridges })
    }
}

fn parse_bridge(raw: RawBridge) -> Result<Bridge, ConfigError> {
    let name = raw.name.unwrap_or_default();
    if name.is_empty() {
        return Err(ConfigError::BridgeNameEmpty);
    }
    let name = collapse_spaces(&name);

    let meilisearch = raw.meilisearch.unwrap_or_default();
    let meilisearch_api_url = meilisearch
        .api_url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ConfigError::ApiUrlRequired { bridge: name.clone() })?;

    let database = parse_database(raw.database.unwrap_or_default(), &name)?;

    if raw.index_map.is_empty() {
        return Err(ConfigError::IndexMapRequired { bridge: name.clone() });
    }

    let mut index_map = BTreeMap::new();
    for (collection, index_config) in raw.index_map {
        if collection.is_empty() {
            return Err(ConfigError::CollectionNameEmpty { bridge: name.clone() });
        }
        let index_config = parse_index_config(index_config, &name, &collection)?;
        index_map.insert(CollectionRef::parse(&collection), index_config);
    }

    Ok(Bridge {
        name,
        meilisearch_api_url,
        meilisearch_api_key: meilisearch.api_key,
        database,
        index_map,
    })
}

fn parse_database(raw: RawDatabase, bridge: &str) -> Result<Database, ConfigError> {
    let engine = Engine::parse(raw.engine.as_deref().unwrap_or(""), bridge)?;

    let host = raw
        .host
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::DatabaseHostRequired { bridge: bridge.to_string() })?;

    let port = raw.port.unwrap_or(0);
    if !(1..=65535).contains(&port) {
        return Err(ConfigError::DatabasePortOutOfRange {
            bridge: bridge.to_string(),
            port,
        });
    }

    let database = raw
        .database
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ConfigError::DatabaseNameRequired { bridge: bridge.to_string() })?;

    Ok(Database {
        engine,
        host,
        port: port as u16,
        user: raw.user,
        password: raw.password,
        database,
        custom_params: raw.custom_params,
    })
}

fn parse_index_config(
    raw: RawIndexConfig,
    bridge: &str,
    collection: &str,
) -> Result<IndexConfig, ConfigError> {
    let index_name = raw
        .index_name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::IndexNameRequired {
            bridge: bridge.to_string(),
            collection: collection.to_string(),
        })?;

    let primary_key = raw
        .primary_key
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::PrimaryKeyRequired {
            bridge: bridge.to_string(),
            collection: collection.to_string(),
        })?;
    let primary_key = Pk::from(primary_key);

    let projection = if raw.fields.is_empty() {
        Projection::identity()
    } else {
        Projection::new(raw.fields)
    };
    projection
        .validate(&primary_key)
        .map_err(|e| match e {
            meilibridge_types::ProjectionError::PrimaryKeyRenamed { pk, renamed_to } => {
                ConfigError::InvalidPrimaryKeyMapping {
                    bridge: bridge.to_string(),
                    collection: collection.to_string(),
                    pk,
                    renamed_to,
                }
            },
        })?;

    Ok(IndexConfig {
        index_name,
        primary_key,
        projection,
        settings: raw.settings,
    })
}

fn collapse_spaces(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("-")
}
