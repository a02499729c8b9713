use crate::image_reference::DEFAULT_TAG;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};
use tracing::level_filters::LevelFilter;

pub const CONFIG_FILE: &str = "CONFIG_FILE";
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const SCHEDULE: &str = "SCHEDULE";
pub const CHECK_INTERVAL: &str = "CHECK_INTERVAL";
pub const RUN_ONCE: &str = "RUN_ONCE";
pub const CLEANUP: &str = "CLEANUP";
pub const NAMESPACE: &str = "NAMESPACE";
pub const DISABLE_NAMESPACES: &str = "DISABLE_NAMESPACES";
pub const INCLUDE_NAMESPACES: &str = "INCLUDE_NAMESPACES";
pub const DISABLE_CONTAINERS: &str = "DISABLE_CONTAINERS";
pub const NOTIFICATION_URL: &str = "NOTIFICATION_URL";
pub const NOTIFICATION_CLUSTER: &str = "NOTIFICATION_CLUSTER";
pub const TAG_POLICY: &str = "TAG_POLICY";
pub const UNKNOWN_DIGEST_POLICY: &str = "UNKNOWN_DIGEST_POLICY";
pub const ROLLOUT_TIMEOUT: &str = "ROLLOUT_TIMEOUT";
pub const ROLLOUT_POLL_INTERVAL: &str = "ROLLOUT_POLL_INTERVAL";
pub const MAX_CONCURRENT_CHECKS: &str = "MAX_CONCURRENT_CHECKS";
pub const WEBSERVER_PORT: &str = "WEBSERVER_PORT";
pub const REGISTRY_CA_CERTIFICATES: &str = "REGISTRY_CA_CERTIFICATES";

const KNOWN_KEYS: [&str; 18] = [
    LOG_LEVEL,
    SCHEDULE,
    CHECK_INTERVAL,
    RUN_ONCE,
    CLEANUP,
    NAMESPACE,
    DISABLE_NAMESPACES,
    INCLUDE_NAMESPACES,
    DISABLE_CONTAINERS,
    NOTIFICATION_URL,
    NOTIFICATION_CLUSTER,
    TAG_POLICY,
    UNKNOWN_DIGEST_POLICY,
    ROLLOUT_TIMEOUT,
    ROLLOUT_POLL_INTERVAL,
    MAX_CONCURRENT_CHECKS,
    WEBSERVER_PORT,
    REGISTRY_CA_CERTIFICATES,
];

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LevelFilter,
    pub mode: RunMode,
    /// Restricts the inventory to one namespace. `None` lists all namespaces.
    pub namespace: Option<String>,
    pub policy: EligibilityPolicy,
    pub notification: Notification,
    pub rollout: RolloutSettings,
    pub max_concurrent_checks: usize,
    pub webserver: Webserver,
    pub tls: Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Interval(Duration),
    Cron(String),
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub url: Option<SecretString>,
    pub cluster: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Tls {
    pub ca_certificate_paths: Vec<PathBuf>,
}

/// Which tags are tracked for digest changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPolicy {
    #[default]
    All,
    LatestOnly,
}

impl FromStr for TagPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(TagPolicy::All),
            "latest" => Ok(TagPolicy::LatestOnly),
            other => bail!("unknown tag policy '{}', expected 'all' or 'latest'", other),
        }
    }
}

/// What to do with a container whose running digest could not be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownDigestPolicy {
    /// Any resolvable remote digest triggers an update.
    #[default]
    Update,
    /// Leave the container alone until a running digest is observable.
    Skip,
}

impl FromStr for UnknownDigestPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(UnknownDigestPolicy::Update),
            "skip" => Ok(UnknownDigestPolicy::Skip),
            other => bail!(
                "unknown digest policy '{}', expected 'update' or 'skip'",
                other
            ),
        }
    }
}

/// Which containers are eligible for updates. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct EligibilityPolicy {
    pub excluded_namespaces: NamespacePatterns,
    /// Empty means every namespace is allowed.
    pub included_namespaces: NamespacePatterns,
    pub excluded_containers: BTreeSet<String>,
    pub tag_policy: TagPolicy,
    pub unknown_digest_policy: UnknownDigestPolicy,
    pub cleanup: bool,
}

impl EligibilityPolicy {
    pub fn is_namespace_allowed(&self, namespace: &str) -> bool {
        if self.excluded_namespaces.matches(namespace) {
            return false;
        }
        self.included_namespaces.is_empty() || self.included_namespaces.matches(namespace)
    }

    pub fn is_container_excluded(&self, container_name: &str) -> bool {
        self.excluded_containers.contains(container_name)
    }

    pub fn is_tag_tracked(&self, tag: &str) -> bool {
        match self.tag_policy {
            TagPolicy::All => true,
            TagPolicy::LatestOnly => tag == DEFAULT_TAG,
        }
    }
}

/// Namespace glob patterns such as `kube-*`.
#[derive(Debug, Clone)]
pub struct NamespacePatterns {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for NamespacePatterns {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }
}

impl NamespacePatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid namespace pattern '{}'", pattern))?,
            );
        }
        let set = builder.build().context("Failed to build namespace patterns")?;
        Ok(Self { patterns, set })
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.set.is_match(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Loads the configuration from `CONFIG_FILE` (if set) overlaid with the process environment.
pub fn load_config() -> Result<Config> {
    let mut values = BTreeMap::new();

    if let Some(path) = env::var(CONFIG_FILE).ok().filter(|p| !p.is_empty()) {
        values.extend(load_config_file(&path)?);
    }

    for key in KNOWN_KEYS {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty()) {
            values.insert(key.to_string(), value);
        }
    }

    Config::from_values(&values)
}

/// Reads a flat YAML mapping of configuration keys. Sequences are joined into comma lists.
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, String>> {
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let raw: BTreeMap<String, serde_yaml_ng::Value> = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    raw.into_iter()
        .filter_map(|(key, value)| match yaml_scalar(&value) {
            Ok(Some(value)) => Some(Ok((key, value))),
            Ok(None) => None,
            Err(e) => Some(Err(e.context(format!("Invalid value for config key {}", key)))),
        })
        .collect()
}

fn yaml_scalar(value: &serde_yaml_ng::Value) -> Result<Option<String>> {
    use serde_yaml_ng::Value;
    Ok(match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Sequence(items) => {
            let items: Result<Vec<Option<String>>> = items.iter().map(yaml_scalar).collect();
            Some(items?.into_iter().flatten().collect::<Vec<_>>().join(","))
        }
        other => bail!("unsupported value {:?}", other),
    })
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        bail!("Missing environment variable: {}", var_name);
    }
    Ok(result.into_owned())
}

impl Config {
    pub fn from_values(values: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let log_level = match get(LOG_LEVEL) {
            Some(level) => LevelFilter::from_str(level)
                .with_context(|| format!("Invalid {} '{}'", LOG_LEVEL, level))?,
            None => LevelFilter::INFO,
        };

        let mode = if get(RUN_ONCE).is_some_and(parse_bool) {
            RunMode::Once
        } else if let Some(schedule) = get(SCHEDULE) {
            RunMode::Cron(schedule.to_string())
        } else {
            RunMode::Interval(duration_or(get(CHECK_INTERVAL), CHECK_INTERVAL, 5 * 60)?)
        };

        let policy = EligibilityPolicy {
            excluded_namespaces: NamespacePatterns::new(parse_list(get(DISABLE_NAMESPACES)))?,
            included_namespaces: NamespacePatterns::new(parse_list(get(INCLUDE_NAMESPACES)))?,
            excluded_containers: parse_list(get(DISABLE_CONTAINERS)).into_iter().collect(),
            tag_policy: get(TAG_POLICY)
                .map(TagPolicy::from_str)
                .transpose()?
                .unwrap_or_default(),
            unknown_digest_policy: get(UNKNOWN_DIGEST_POLICY)
                .map(UnknownDigestPolicy::from_str)
                .transpose()?
                .unwrap_or_default(),
            cleanup: get(CLEANUP).is_none_or(parse_bool),
        };

        let rollout = RolloutSettings {
            timeout: duration_or(get(ROLLOUT_TIMEOUT), ROLLOUT_TIMEOUT, 5 * 60)?,
            poll_interval: duration_or(get(ROLLOUT_POLL_INTERVAL), ROLLOUT_POLL_INTERVAL, 2)?,
        };

        let max_concurrent_checks = match get(MAX_CONCURRENT_CHECKS) {
            Some(n) => n
                .parse::<usize>()
                .with_context(|| format!("Invalid {} '{}'", MAX_CONCURRENT_CHECKS, n))?
                .max(1),
            None => 4,
        };

        let port = match get(WEBSERVER_PORT) {
            Some(p) => p
                .parse::<u16>()
                .with_context(|| format!("Invalid {} '{}'", WEBSERVER_PORT, p))?,
            None => 8080,
        };

        Ok(Config {
            log_level,
            mode,
            namespace: get(NAMESPACE).map(str::to_string),
            policy,
            notification: Notification {
                url: get(NOTIFICATION_URL).map(SecretString::new),
                cluster: get(NOTIFICATION_CLUSTER)
                    .unwrap_or("kubernetes")
                    .to_string(),
            },
            rollout,
            max_concurrent_checks,
            webserver: Webserver { port },
            tls: Tls {
                ca_certificate_paths: parse_list(get(REGISTRY_CA_CERTIFICATES))
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            },
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn duration_or(value: Option<&str>, key: &str, default_secs: u64) -> Result<Duration> {
    let Some(v) = value else {
        return Ok(Duration::from_secs(default_secs));
    };
    let duration = parse_duration(v).with_context(|| format!("Invalid {} '{}'", key, v))?;
    if duration.is_zero() {
        bail!("Invalid {} '{}': must be greater than zero", key, v);
    }
    Ok(duration)
}

/// Parses durations like `90s`, `5m` or `1h30m`. A bare number is read as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(value)?)
}
