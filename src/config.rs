use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for perfsentry.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Parameter server listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Parameter server client configuration used by ranks.
    #[serde(default)]
    pub client: ClientConfig,

    /// Anomaly detection configuration.
    #[serde(default)]
    pub detector: DetectorConfig,
}

/// Parameter server listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Snapshot written by `POST /dump` and on shutdown. Unset disables the
    /// shutdown dump and makes `/dump` require an explicit path.
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
}

/// Parameter server client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Parameter server base URL (e.g., "http://localhost:8080"). Empty runs
    /// with an in-process server.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_client_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Classification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Sigma threshold over merged running statistics.
    #[default]
    Streaming,
    /// Local outlier factor over `(entry, runtime)`.
    Batch,
}

/// Lifetime of a rank's local statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalScope {
    /// Reset at the start of every frame.
    #[default]
    Frame,
    /// Accumulated for the whole run; only the delta is pushed.
    Rank,
}

/// What to classify against when the parameter server cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushFailurePolicy {
    /// Use the rank's local statistics.
    #[default]
    Local,
    /// Label every sample of the frame normal.
    Normal,
}

/// Distance between two `(entry, runtime)` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Euclidean,
    Manhattan,
    Chebyshev,
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Threshold multiplier k in `mean + k * stddev`. Default: 12.
    #[serde(default = "default_sigma")]
    pub sigma: f64,

    /// The threshold applies only once the sample count exceeds this. Default: 1.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    #[serde(default)]
    pub local_scope: LocalScope,

    /// Classify against the merged statistics returned by the server. Default: true.
    #[serde(default = "default_true")]
    pub pull_global: bool,

    #[serde(default)]
    pub on_push_failure: PushFailurePolicy,

    /// Functions nested this deep or deeper are never reported as of interest. Default: 10.
    #[serde(default = "default_max_depth_of_interest")]
    pub max_depth_of_interest: usize,

    /// Batch detector parameters.
    #[serde(default)]
    pub lof: LofConfig,
}

/// Local outlier factor parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LofConfig {
    /// Neighbourhood size. Default: 20.
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: usize,

    /// Accepted for compatibility; neighbour search is exhaustive. Default: 30.
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,

    #[serde(default)]
    pub metric: Metric,

    /// Expected anomalous fraction in (0, 0.5]. Default: 0.1.
    #[serde(default = "default_contamination")]
    pub contamination: f64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_sigma() -> f64 {
    12.0
}

fn default_min_samples() -> u64 {
    1
}

fn default_max_depth_of_interest() -> usize {
    10
}

fn default_n_neighbors() -> usize {
    20
}

fn default_leaf_size() -> usize {
    30
}

fn default_contamination() -> f64 {
    0.1
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            dump_path: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_client_timeout(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            sigma: default_sigma(),
            min_samples: default_min_samples(),
            local_scope: LocalScope::default(),
            pull_global: true,
            on_push_failure: PushFailurePolicy::default(),
            max_depth_of_interest: default_max_depth_of_interest(),
            lof: LofConfig::default(),
        }
    }
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            n_neighbors: default_n_neighbors(),
            leaf_size: default_leaf_size(),
            metric: Metric::default(),
            contamination: default_contamination(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        if !self.client.endpoint.is_empty() {
            if !self.client.endpoint.starts_with("http://")
                && !self.client.endpoint.starts_with("https://")
            {
                bail!(
                    "client.endpoint must be an http(s) URL, got {:?}",
                    self.client.endpoint
                );
            }
            if self.client.timeout.is_zero() {
                bail!("client.timeout must be positive");
            }
        }

        self.detector.validate()
    }

    /// Log filter to install: the command-line value wins over the file.
    pub fn log_filter<'a>(&'a self, cli: Option<&'a str>) -> &'a str {
        cli.unwrap_or(&self.log_level)
    }
}

impl DetectorConfig {
    /// Validate detector parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            bail!("detector.sigma must be a positive number, got {}", self.sigma);
        }

        if self.max_depth_of_interest == 0 {
            bail!("detector.max_depth_of_interest must be positive");
        }

        if self.lof.n_neighbors == 0 {
            bail!("detector.lof.n_neighbors must be positive");
        }

        if self.lof.leaf_size == 0 {
            bail!("detector.lof.leaf_size must be positive");
        }

        if !(self.lof.contamination > 0.0 && self.lof.contamination <= 0.5) {
            bail!(
                "detector.lof.contamination must be in (0, 0.5], got {}",
                self.lof.contamination
            );
        }

        Ok(())
    }
}
