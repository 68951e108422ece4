//! Storage configuration types.

use serde::Deserialize;

/// Storage backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Mongodb,
}

/// Collection layout discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One document per stream with an embedded event list. No global order.
    Embedded,
    /// Separate events and streams collections with a global position counter.
    #[default]
    Normalized,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Collection layout.
    pub layout: Layout,
    /// MongoDB-specific configuration.
    pub mongodb: MongodbConfig,
    /// Namespaces bootstrapped at open, in addition to the default one.
    pub namespaces: Vec<String>,
}

/// MongoDB-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongodbConfig {
    /// MongoDB connection URI. Must point at a replica set.
    pub uri: String,
    /// Database name.
    pub database: String,
}

impl Default for MongodbConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017/?replicaSet=rs0".to_string(),
            database: "eventline".to_string(),
        }
    }
}
