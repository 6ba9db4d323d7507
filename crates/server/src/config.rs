//! YAML configuration with environment overrides.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashlite_api::IdentityResolver;
use dashlite_cache::{CacheCategory, TtlPolicy};
use dashlite_core::{Identity, PatternAccessFilter};
use dashlite_hub::HubConfig;
use dashlite_kubehub::{RetryPolicy, WatchConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub kubernetes: KubeConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds.
    pub default_ttl: u64,
    /// Per-category overrides, seconds.
    pub ttl: BTreeMap<CacheCategory, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_ttl: 30, ttl: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePermissions {
    pub allowed_namespace_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub allow_anonymous_access: bool,
    pub anonymous_role: Option<String>,
    pub permissions: BTreeMap<String, RolePermissions>,
    /// Static bearer tokens.
    pub tokens: BTreeMap<String, Identity>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Watch,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub mode: SyncMode,
    /// Serve built-in demo fixtures instead of a live cluster.
    pub mock: bool,
    pub poll_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub watch_max_retries: u32,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Watch,
            mock: false,
            poll_interval_secs: 15,
            metrics_interval_secs: 30,
            request_timeout_secs: 10,
            max_attempts: 3,
            backoff_initial_ms: 200,
            backoff_max_ms: 5000,
            watch_max_retries: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { batch_size: 100, queue_capacity: 1024, ping_interval_secs: 20, ping_timeout_secs: 10 }
    }
}

impl Config {
    /// Reads `path` (defaults when `None`) and applies `DASHLITE_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
                Self::from_yaml(&raw).with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("DASHLITE_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("DASHLITE_DEFAULT_TTL") {
            self.cache.default_ttl = v.parse().with_context(|| format!("DASHLITE_DEFAULT_TTL={v}"))?;
        }
        if let Some(v) = get("DASHLITE_ALLOW_ANONYMOUS") {
            self.auth.allow_anonymous_access = parse_bool(&v).with_context(|| format!("DASHLITE_ALLOW_ANONYMOUS={v}"))?;
        }
        if let Some(v) = get("DASHLITE_MODE") {
            self.kubernetes.mode = match v.to_ascii_lowercase().as_str() {
                "watch" => SyncMode::Watch,
                "poll" => SyncMode::Poll,
                _ => bail!("DASHLITE_MODE={v}: expected watch or poll"),
            };
        }
        if let Some(v) = get("DASHLITE_K8S_MOCK") {
            self.kubernetes.mock = parse_bool(&v).with_context(|| format!("DASHLITE_K8S_MOCK={v}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("server.bind {:?}: expected host:port", self.server.bind))?;
        if self.cache.default_ttl == 0 {
            bail!("cache.default_ttl must be positive");
        }
        if let Some((cat, _)) = self.cache.ttl.iter().find(|(_, secs)| **secs == 0) {
            bail!("cache.ttl.{cat} must be positive");
        }
        if self.auth.allow_anonymous_access {
            match &self.auth.anonymous_role {
                None => bail!("auth.anonymous_role is required when anonymous access is enabled"),
                Some(role) if !self.auth.permissions.contains_key(role) => {
                    bail!("auth.anonymous_role {role:?} has no entry in auth.permissions")
                }
                Some(_) => {}
            }
        }
        if self.stream.batch_size == 0 || self.stream.queue_capacity == 0 {
            bail!("stream.batch_size and stream.queue_capacity must be positive");
        }
        if self.stream.ping_interval_secs == 0 || self.stream.ping_timeout_secs == 0 {
            bail!("stream.ping_interval_secs and stream.ping_timeout_secs must be positive");
        }
        if self.kubernetes.poll_interval_secs == 0 || self.kubernetes.metrics_interval_secs == 0 {
            bail!("kubernetes poll intervals must be positive");
        }
        if self.kubernetes.request_timeout_secs == 0 {
            bail!("kubernetes.request_timeout_secs must be positive");
        }
        if self.kubernetes.max_attempts == 0 {
            bail!("kubernetes.max_attempts must be at least 1");
        }
        self.access_filter()?;
        Ok(())
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.cache
            .ttl
            .iter()
            .fold(TtlPolicy::new(Duration::from_secs(self.cache.default_ttl)), |p, (cat, secs)| {
                p.with(*cat, Duration::from_secs(*secs))
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let k = &self.kubernetes;
        RetryPolicy {
            timeout: Duration::from_secs(k.request_timeout_secs),
            max_attempts: k.max_attempts,
            backoff_initial: Duration::from_millis(k.backoff_initial_ms),
            backoff_max: Duration::from_millis(k.backoff_max_ms),
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig { max_retries: self.kubernetes.watch_max_retries, ..WatchConfig::default() }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            batch_size: self.stream.batch_size,
            queue_capacity: self.stream.queue_capacity,
            ping_interval: Duration::from_secs(self.stream.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.stream.ping_timeout_secs),
        }
    }

    pub fn access_filter(&self) -> Result<PatternAccessFilter> {
        let patterns: BTreeMap<String, Vec<String>> = self
            .auth
            .permissions
            .iter()
            .map(|(role, p)| (role.clone(), p.allowed_namespace_patterns.clone()))
            .collect();
        Ok(PatternAccessFilter::new(&patterns)?)
    }

    pub fn identity_resolver(&self) -> IdentityResolver {
        let anonymous = match (&self.auth.allow_anonymous_access, &self.auth.anonymous_role) {
            (true, Some(role)) => Some(Identity::new("anonymous", [role.clone()])),
            _ => None,
        };
        IdentityResolver::new(self.auth.tokens.clone(), anonymous)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("expected a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
server:
  bind: "127.0.0.1:9000"
cache:
  default_ttl: 20
  ttl:
    pods: 5
    metrics: 10
auth:
  allow_anonymous_access: true
  anonymous_role: viewer
  permissions:
    viewer:
      allowed_namespace_patterns: ["project-.*-staging$"]
    admin:
      allowed_namespace_patterns: [".*"]
  tokens:
    s3cret:
      username: alice
      roles: [admin]
kubernetes:
  mode: poll
"#;

    #[test]
    fn parses_sample_with_defaults_filled() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.kubernetes.mode, SyncMode::Poll);
        assert_eq!(cfg.kubernetes.poll_interval_secs, 15);
        assert_eq!(cfg.stream.batch_size, 100);
        cfg.validate().unwrap();

        let ttl = cfg.ttl_policy();
        assert_eq!(ttl.ttl_for(CacheCategory::Pods), Duration::from_secs(5));
        assert_eq!(ttl.ttl_for(CacheCategory::Deployments), Duration::from_secs(20));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
        Config::default().validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> =
            [("DASHLITE_BIND", "127.0.0.1:1"), ("DASHLITE_MODE", "POLL"), ("DASHLITE_K8S_MOCK", "1")].into_iter().collect();
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:1");
        assert_eq!(cfg.kubernetes.mode, SyncMode::Poll);
        assert!(cfg.kubernetes.mock);

        let mut cfg = Config::default();
        assert!(cfg.apply_env(|k| (k == "DASHLITE_DEFAULT_TTL").then(|| "soon".to_string())).is_err());
    }

    #[test]
    fn anonymous_access_needs_a_known_role() {
        let mut cfg = Config::default();
        cfg.auth.allow_anonymous_access = true;
        assert!(cfg.validate().is_err());
        cfg.auth.anonymous_role = Some("viewer".into());
        assert!(cfg.validate().is_err());
        cfg.auth.permissions.insert("viewer".into(), RolePermissions::default());
        cfg.validate().unwrap();
        assert!(cfg.identity_resolver().anonymous_enabled());
    }

    #[test]
    fn bad_pattern_fails_validation() {
        let mut cfg = Config::default();
        cfg.auth
            .permissions
            .insert("x".into(), RolePermissions { allowed_namespace_patterns: vec!["(".into()] });
        assert!(cfg.validate().is_err());
    }

    fn rejected(edit: impl FnOnce(&mut Config)) -> String {
        let mut cfg = Config::default();
        edit(&mut cfg);
        cfg.validate().unwrap_err().to_string()
    }

    #[test]
    fn zero_request_timeout_is_rejected() {
        assert!(rejected(|c| c.kubernetes.request_timeout_secs = 0).contains("request_timeout_secs"));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        assert!(rejected(|c| c.kubernetes.max_attempts = 0).contains("max_attempts"));
    }

    #[test]
    fn zero_ping_settings_are_rejected() {
        assert!(rejected(|c| c.stream.ping_timeout_secs = 0).contains("ping_timeout_secs"));
        assert!(rejected(|c| c.stream.ping_interval_secs = 0).contains("ping_interval_secs"));
    }

    #[test]
    fn zero_category_ttl_is_rejected() {
        let msg = rejected(|c| {
            c.cache.ttl.insert(CacheCategory::Pods, 0);
        });
        assert_eq!(msg, "cache.ttl.pods must be positive");
    }
}
