use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub clickhouse: ClickHouseConfig,
    pub storage: StorageConfig,
    pub api_key: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub default_limit: u64,
    pub max_limit: u64,
    pub request_timeout: Duration,
    pub export_url_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    reportql_listen_addr: Option<String>,
    #[serde(default)]
    reportql_listen_host: Option<String>,
    #[serde(default)]
    reportql_listen_port: Option<u16>,
    #[serde(default = "default_clickhouse_url")]
    clickhouse_url: String,
    #[serde(default = "default_clickhouse_user")]
    clickhouse_user: String,
    #[serde(default)]
    clickhouse_password: String,
    #[serde(default = "default_clickhouse_database")]
    clickhouse_database: String,
    #[serde(default = "default_minio_endpoint")]
    minio_endpoint: String,
    #[serde(default = "default_minio_credential")]
    minio_access_key: String,
    #[serde(default = "default_minio_credential")]
    minio_secret_key: String,
    #[serde(default = "default_minio_bucket")]
    minio_bucket_name: String,
    #[serde(default = "default_minio_region")]
    minio_region: String,
    #[serde(default)]
    reportql_api_key: Option<String>,
    #[serde(default)]
    reportql_allowed_origins: Option<String>,
    #[serde(default = "default_page_size")]
    reportql_default_page_size: u64,
    #[serde(default = "default_max_page_size")]
    reportql_max_page_size: u64,
    #[serde(default = "default_limit")]
    reportql_default_limit: u64,
    #[serde(default = "default_max_limit")]
    reportql_max_limit: u64,
    #[serde(default = "default_timeout_secs")]
    reportql_request_timeout_secs: u64,
    #[serde(default = "default_export_ttl_hours")]
    reportql_export_url_ttl_hours: u64,
}

fn default_clickhouse_url() -> String {
    "http://clickhouse:8123".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_minio_endpoint() -> String {
    "http://minio:9000".to_string()
}

fn default_minio_credential() -> String {
    "minioadmin".to_string()
}

fn default_minio_bucket() -> String {
    "data-bucket".to_string()
}

fn default_minio_region() -> String {
    "us-east-1".to_string()
}

const fn default_page_size() -> u64 {
    50
}

const fn default_max_page_size() -> u64 {
    10_000
}

const fn default_limit() -> u64 {
    1_000
}

const fn default_max_limit() -> u64 {
    100_000
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_export_ttl_hours() -> u64 {
    24
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig = envy::from_env()
            .context("failed to parse REPORTQL_*, CLICKHOUSE_* and MINIO_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.reportql_listen_addr,
            raw.reportql_listen_host,
            raw.reportql_listen_port,
        )?;

        let allowed_origins = raw.reportql_allowed_origins.and_then(|csv| {
            let trimmed: Vec<_> = csv
                .split(',')
                .filter_map(|part| {
                    let entry = part.trim();
                    if entry.is_empty() {
                        None
                    } else {
                        Some(entry.to_string())
                    }
                })
                .collect();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        });

        let max_page_size = raw.reportql_max_page_size.max(1);
        let max_limit = raw.reportql_max_limit.max(1);

        Ok(Self {
            listen_addr,
            clickhouse: ClickHouseConfig {
                url: raw.clickhouse_url,
                user: raw.clickhouse_user,
                password: raw.clickhouse_password,
                database: raw.clickhouse_database,
            },
            storage: StorageConfig {
                endpoint: raw.minio_endpoint,
                access_key: raw.minio_access_key,
                secret_key: raw.minio_secret_key,
                bucket: raw.minio_bucket_name,
                region: raw.minio_region,
            },
            api_key: raw.reportql_api_key.filter(|key| !key.is_empty()),
            allowed_origins,
            default_page_size: raw.reportql_default_page_size.clamp(1, max_page_size),
            max_page_size,
            default_limit: raw.reportql_default_limit.clamp(1, max_limit),
            max_limit,
            request_timeout: Duration::from_secs(raw.reportql_request_timeout_secs.max(1)),
            export_url_ttl: export_url_ttl(raw.reportql_export_url_ttl_hours),
        })
    }

    /// Defaults for embedding the engine without reading the environment.
    pub fn embedded(clickhouse_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            clickhouse: ClickHouseConfig {
                url: clickhouse_url,
                user: default_clickhouse_user(),
                password: String::new(),
                database: default_clickhouse_database(),
            },
            storage: StorageConfig {
                endpoint: default_minio_endpoint(),
                access_key: default_minio_credential(),
                secret_key: default_minio_credential(),
                bucket: default_minio_bucket(),
                region: default_minio_region(),
            },
            api_key: None,
            allowed_origins: None,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
            export_url_ttl: export_url_ttl(default_export_ttl_hours()),
        }
    }

    /// Clamps a requested row limit into `[1, max_limit]`.
    pub fn determine_limit(&self, candidate: Option<u64>, default: u64) -> u64 {
        candidate.unwrap_or(default).clamp(1, self.max_limit)
    }

    pub fn determine_page_size(&self, candidate: Option<u64>) -> u64 {
        candidate
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid REPORTQL_LISTEN_ADDR value")?
            .next()
            .context("REPORTQL_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8000);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

/// S3 presigned URLs are valid for at most seven days.
const MAX_EXPORT_URL_TTL_HOURS: u64 = 7 * 24;

fn export_url_ttl(hours: u64) -> Duration {
    Duration::from_secs(hours.clamp(1, MAX_EXPORT_URL_TTL_HOURS) * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_url_ttl_is_capped_at_seven_days() {
        assert_eq!(export_url_ttl(0), Duration::from_secs(3600));
        assert_eq!(export_url_ttl(24), Duration::from_secs(24 * 3600));
        assert_eq!(export_url_ttl(168), Duration::from_secs(168 * 3600));
        assert_eq!(export_url_ttl(u64::MAX), Duration::from_secs(168 * 3600));
    }

    #[test]
    fn limits_are_clamped_not_rejected() {
        let config = AppConfig::embedded("http://localhost:8123".to_string());

        assert_eq!(config.determine_limit(None, 1_000), 1_000);
        assert_eq!(config.determine_limit(Some(0), 1_000), 1);
        assert_eq!(config.determine_limit(Some(5_000_000), 1_000), 100_000);
        assert_eq!(config.determine_page_size(None), 50);
        assert_eq!(config.determine_page_size(Some(20_000)), 10_000);
    }

    #[test]
    fn listen_address_defaults_to_port_8000() {
        let addr = resolve_addr(None, Some("127.0.0.1".into()), None).unwrap();
        assert_eq!(addr.port(), 8000);
    }
}
