use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use crate::time::CronSchedule;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub templates_database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_keys: Vec<String>,
    pub query: QuerySettings,
    pub cache: CacheSettings,
    pub catalog_schema: String,
}

/// Limits and policy applied to ad-hoc and template queries.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub timeout: Duration,
    pub max_rows: usize,
    pub allowed_commands: Vec<String>,
    pub enable_validation: bool,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub valkey_url: String,
    pub scheduler_enabled: bool,
    pub cron_expression: String,
    pub source_query: String,
    pub scan_page_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(default_timeout_secs()),
            max_rows: default_max_rows(),
            allowed_commands: vec!["SELECT".to_string()],
            enable_validation: true,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            valkey_url: default_valkey_url(),
            scheduler_enabled: true,
            cron_expression: default_cron(),
            source_query: default_source_query(),
            scan_page_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    querygate_listen_addr: Option<String>,
    #[serde(default)]
    querygate_listen_host: Option<String>,
    #[serde(default)]
    querygate_listen_port: Option<u16>,
    #[serde(default)]
    querygate_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    querygate_templates_database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    querygate_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    querygate_api_keys: Option<String>,
    #[serde(default = "default_timeout_secs")]
    querygate_query_timeout_secs: u64,
    #[serde(default = "default_max_rows")]
    querygate_max_rows: usize,
    #[serde(default)]
    querygate_allowed_commands: Option<String>,
    #[serde(default = "default_true")]
    querygate_enable_query_validation: bool,
    #[serde(default = "default_valkey_url")]
    querygate_valkey_url: String,
    #[serde(default = "default_true")]
    querygate_cache_scheduler_enabled: bool,
    #[serde(default = "default_cron")]
    querygate_cache_cron: String,
    #[serde(default = "default_source_query")]
    querygate_container_source_query: String,
    #[serde(default = "default_catalog_schema")]
    querygate_catalog_schema: String,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_rows() -> usize {
    1000
}

const fn default_true() -> bool {
    true
}

fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_source_query() -> String {
    "SELECT * FROM containers".to_string()
}

fn default_catalog_schema() -> String {
    "public".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse QUERYGATE_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.querygate_listen_addr,
            raw.querygate_listen_host,
            raw.querygate_listen_port,
        )?;

        let database_url = raw
            .querygate_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("QUERYGATE_DATABASE_URL or DATABASE_URL must be set")?;
        let templates_database_url = raw
            .querygate_templates_database_url
            .unwrap_or_else(|| database_url.clone());

        CronSchedule::parse(&raw.querygate_cache_cron)
            .context("invalid QUERYGATE_CACHE_CRON expression")?;

        let allowed_commands = raw
            .querygate_allowed_commands
            .map(|csv| split_csv(&csv))
            .filter(|commands| !commands.is_empty())
            .unwrap_or_else(|| vec!["SELECT".to_string()]);

        Ok(Self {
            listen_addr,
            database_url,
            templates_database_url,
            max_pool_size: raw.querygate_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            api_keys: raw
                .querygate_api_keys
                .map(|csv| split_csv(&csv))
                .unwrap_or_default(),
            query: QuerySettings {
                timeout: Duration::from_secs(raw.querygate_query_timeout_secs.max(1)),
                max_rows: raw.querygate_max_rows.max(1),
                allowed_commands,
                enable_validation: raw.querygate_enable_query_validation,
            },
            cache: CacheSettings {
                valkey_url: raw.querygate_valkey_url,
                scheduler_enabled: raw.querygate_cache_scheduler_enabled,
                cron_expression: raw.querygate_cache_cron,
                source_query: raw.querygate_container_source_query,
                scan_page_size: 1000,
            },
            catalog_schema: raw.querygate_catalog_schema,
        })
    }

    /// Configuration with defaults for everything but the database, used by tests and
    /// in-process embedding.
    pub fn embedded(database_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            templates_database_url: database_url.clone(),
            database_url,
            max_pool_size: 1,
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            api_keys: Vec::new(),
            query: QuerySettings::default(),
            cache: CacheSettings::default(),
            catalog_schema: default_catalog_schema(),
        }
    }
}

fn split_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .filter_map(|part| {
            let entry = part.trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect()
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid QUERYGATE_LISTEN_ADDR value")?
            .next()
            .context("QUERYGATE_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8480);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "QUERYGATE_DATABASE_URL",
        "QUERYGATE_TEMPLATES_DATABASE_URL",
        "QUERYGATE_API_KEYS",
        "QUERYGATE_ALLOWED_COMMANDS",
        "QUERYGATE_MAX_ROWS",
        "QUERYGATE_CACHE_CRON",
        "QUERYGATE_LISTEN_PORT",
        "QUERYGATE_ENABLE_QUERY_VALIDATION",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn split_csv_drops_blank_entries() {
        assert_eq!(split_csv(" a, ,b ,,"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_csv(" , ").is_empty());
    }

    #[test]
    #[serial]
    fn from_env_applies_defaults() {
        clear_env();
        env::set_var("QUERYGATE_DATABASE_URL", "postgres://ops/db");

        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.database_url, "postgres://ops/db");
        assert_eq!(config.templates_database_url, "postgres://ops/db");
        assert!(config.api_keys.is_empty());
        assert_eq!(config.query.allowed_commands, vec!["SELECT".to_string()]);
        assert_eq!(config.query.max_rows, 1000);
        assert!(config.query.enable_validation);
        assert_eq!(config.cache.cron_expression, "0 */5 * * * *");
        assert_eq!(config.listen_addr.port(), 8480);

        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        clear_env();
        env::set_var("QUERYGATE_DATABASE_URL", "postgres://ops/db");
        env::set_var("QUERYGATE_TEMPLATES_DATABASE_URL", "postgres://meta/db");
        env::set_var("QUERYGATE_API_KEYS", "k1, k2");
        env::set_var("QUERYGATE_ALLOWED_COMMANDS", "select,with");
        env::set_var("QUERYGATE_MAX_ROWS", "25");
        env::set_var("QUERYGATE_LISTEN_PORT", "9000");
        env::set_var("QUERYGATE_ENABLE_QUERY_VALIDATION", "false");

        let config = AppConfig::from_env().expect("config should parse");
        assert_eq!(config.templates_database_url, "postgres://meta/db");
        assert_eq!(config.api_keys, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(
            config.query.allowed_commands,
            vec!["select".to_string(), "with".to_string()]
        );
        assert_eq!(config.query.max_rows, 25);
        assert_eq!(config.listen_addr.port(), 9000);
        assert!(!config.query.enable_validation);

        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_rejects_bad_cron() {
        clear_env();
        env::set_var("QUERYGATE_DATABASE_URL", "postgres://ops/db");
        env::set_var("QUERYGATE_CACHE_CRON", "every five minutes");

        let err = AppConfig::from_env().expect_err("cron should be rejected");
        assert!(err.to_string().contains("QUERYGATE_CACHE_CRON"));

        clear_env();
    }
}
