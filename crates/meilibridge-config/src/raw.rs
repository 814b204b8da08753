use std::collections::BTreeMap;

use serde::Deserialize;

use crate::settings::IndexSettings;

/// The as-written YAML shape (spec.md §6). Every field that the validated
/// [`crate::Config`] requires is optional here, since `serde_yaml` has no way
/// to tell "missing" from "absent by design" on its own; [`crate::Config`]'s
/// `TryFrom` is where that distinction actually gets enforced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub general: Option<RawGeneral>,
    #[serde(default)]
    pub bridges: Vec<RawBridge>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawGeneral {
    pub auto_bulk_interval: Option<i64>,
    pub pprof: Option<RawPprof>,
    pub trigger_sync: Option<RawTriggerSync>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPprof {
    #[serde(default)]
    pub enable: bool,
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTriggerSync {
    pub listen: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBridge {
    pub name: Option<String>,
    pub meilisearch: Option<RawMeilisearch>,
    pub database: Option<RawDatabase>,
    #[serde(default)]
    pub index_map: BTreeMap<String, RawIndexConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMeilisearch {
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDatabase {
    pub engine: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(default)]
    pub custom_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawIndexConfig {
    pub index_name: Option<String>,
    pub primary_key: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub settings: Option<IndexSettings>,
}
