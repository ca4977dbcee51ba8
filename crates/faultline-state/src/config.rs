use serde::Deserialize;

/// Storage backend selection, tagged by `backend`.
///
/// ```toml
/// [storage]
/// backend = "postgres"
/// url = "postgres://faultline@localhost/faultline"
/// ```
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[cfg(feature = "postgres")]
fn default_max_connections() -> u32 {
    10
}
