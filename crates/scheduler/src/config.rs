use std::path::Path;

use serde::Deserialize;

/// Top-level daemon configuration, loaded from a TOML file. Every section
/// is optional; missing sections take the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub registry: RegistryConfig,
    pub droplet: CacheConfig,
    pub package: CacheConfig,
    pub buildpack: CacheConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            registry: RegistryConfig::default(),
            droplet: CacheConfig::droplet_defaults(),
            package: CacheConfig::package_defaults(),
            buildpack: CacheConfig::buildpack_defaults(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    /// Upload body cap in MiB; 0 disables the limit.
    pub max_upload_mb: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 9091, max_upload_mb: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Advertisements older than this are ineligible and get pruned.
    /// Must track the node advertise interval with modest slack.
    pub node_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { node_timeout_secs: 10 }
    }
}

/// Per-class cache tuning. The three classes share a base dir by default
/// but keep separate class directories, TTLs and pressure thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_base_dir: String,
    pub cache_directory: String,
    pub cache_time_out_secs: u64,
    pub cache_interval_secs: u64,
    pub disk_max_used_percent: u64,
}

impl CacheConfig {
    pub fn droplet_defaults() -> Self {
        Self {
            cache_base_dir: "/droplets".into(),
            cache_directory: "cc-droplets".into(),
            cache_time_out_secs: 60 * 60 * 24 * 10,
            cache_interval_secs: 3600,
            disk_max_used_percent: 60,
        }
    }

    pub fn package_defaults() -> Self {
        Self {
            cache_directory: "cc-packages".into(),
            disk_max_used_percent: 70,
            ..Self::droplet_defaults()
        }
    }

    pub fn buildpack_defaults() -> Self {
        Self {
            cache_directory: "cc-buildpack".into(),
            cache_time_out_secs: 60 * 60 * 24 * 5,
            disk_max_used_percent: 70,
            ..Self::droplet_defaults()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::droplet_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub access_key: String,
    pub secret_key: String,
    pub droplet_bucket: String,
    pub app_package_bucket: String,
    /// Value of the `host` header sent with every signed request.
    pub host: String,
    /// Scheme + authority prefixed to the signed resource path.
    pub domain: String,
    /// Label prefixed to the authorization header value.
    pub auth_scheme: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            droplet_bucket: "jae-droplets".into(),
            app_package_bucket: "jae-apppackage".into(),
            host: String::new(),
            domain: String::new(),
            auth_scheme: "jss".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_differ_per_class() {
        let cfg = Config::default();
        assert_eq!(cfg.droplet.cache_directory, "cc-droplets");
        assert_eq!(cfg.package.cache_directory, "cc-packages");
        assert_eq!(cfg.buildpack.cache_directory, "cc-buildpack");
        assert_eq!(cfg.droplet.disk_max_used_percent, 60);
        assert_eq!(cfg.buildpack.cache_time_out_secs, 60 * 60 * 24 * 5);
        assert_eq!(cfg.registry.node_timeout_secs, 10);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: Config = toml::from_str(
            r#"
            [http]
            port = 9191

            [droplet]
            cache_base_dir = "/var/cache/artifacts"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 9191);
        assert_eq!(cfg.droplet.cache_base_dir, "/var/cache/artifacts");
        // Unnamed sections keep their own class defaults.
        assert_eq!(cfg.package.cache_directory, "cc-packages");
        assert_eq!(cfg.store.droplet_bucket, "jae-droplets");
    }
}
