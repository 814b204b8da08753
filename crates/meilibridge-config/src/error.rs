use thiserror::Error;

/// Configuration errors are fatal at startup (spec.md §7): the process never
/// begins work against a config it cannot validate.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode config file: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("bridge configuration is missing")]
    MissingBridges,

    #[error("bridge name is empty")]
    BridgeNameEmpty,

    #[error("meilisearch api_url is required (bridge `{bridge}`)")]
    ApiUrlRequired { bridge: String },

    #[error("database host is required (bridge `{bridge}`)")]
    DatabaseHostRequired { bridge: String },

    #[error("database port must be in 1..=65535, got {port} (bridge `{bridge}`)")]
    DatabasePortOutOfRange { bridge: String, port: i64 },

    #[error("database name is required (bridge `{bridge}`)")]
    DatabaseNameRequired { bridge: String },

    #[error("engine `{engine}` is not supported (bridge `{bridge}`)")]
    UnsupportedEngine { bridge: String, engine: String },

    #[error("index_map is required and must be non-empty (bridge `{bridge}`)")]
    IndexMapRequired { bridge: String },

    #[error("collection name is empty (bridge `{bridge}`)")]
    CollectionNameEmpty { bridge: String },

    #[error("index_name is required (bridge `{bridge}`, collection `{collection}`)")]
    IndexNameRequired { bridge: String, collection: String },

    #[error("primary_key is required (bridge `{bridge}`, collection `{collection}`)")]
    PrimaryKeyRequired { bridge: String, collection: String },

    #[error(
        "primary key `{pk}` is renamed to `{renamed_to}` by the field mapping (bridge `{bridge}`, \
         collection `{collection}`); the primary key must keep its own name"
    )]
    InvalidPrimaryKeyMapping {
        bridge: String,
        collection: String,
        pk: String,
        renamed_to: String,
    },

    #[error("general.auto_bulk_interval must be >= 1, got {0}")]
    AutoBulkIntervalTooSmall(i64),

    #[error("general.trigger_sync.listen is required when trigger_sync is configured")]
    TriggerSyncListenRequired,
}
