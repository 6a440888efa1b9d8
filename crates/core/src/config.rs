use serde::Deserialize;

/// Minimum Monte Carlo draws for a stable two-decimal win rate.
pub const MIN_MONTE_CARLO_SAMPLES: usize = 10_000;

/// Root application configuration. Loaded from an optional config file and
/// environment variables with the prefix `PISCES__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub experiments: ExperimentsConfig,
    #[serde(default)]
    pub traffic: TrafficSettings,
    #[serde(default)]
    pub bandit: BanditSettings,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_sticky_ttl_secs")]
    pub sticky_ttl_secs: u64,
    #[serde(default = "default_bandit_ttl_secs")]
    pub bandit_ttl_secs: u64,
    /// Idle connections kept open for reuse.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentsConfig {
    /// JSON array of experiment definitions saved at startup when missing
    /// from the catalog.
    #[serde(default)]
    pub seed_path: Option<String>,
    /// TTL of the metadata cache in front of the Redis catalog; 0 disables it.
    #[serde(default)]
    pub cache_ttl_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrafficSettings {
    /// Makes RANDOM allocation reproducible per (visitor, experiment).
    #[serde(default)]
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditSettings {
    #[serde(default = "default_ucb_exploration")]
    pub ucb_exploration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_monte_carlo_samples")]
    pub monte_carlo_samples: usize,
    #[serde(default = "default_early_stop_threshold")]
    pub early_stop_threshold: f64,
    /// CONVERT events with a value at or below this count as failed rewards.
    #[serde(default)]
    pub reward_value_threshold: Option<f64>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_sticky_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_bandit_ttl_secs() -> u64 {
    90 * 24 * 3600
}
fn default_max_idle_connections() -> usize {
    16
}
fn default_ucb_exploration() -> f64 {
    2.0
}
fn default_monte_carlo_samples() -> usize {
    MIN_MONTE_CARLO_SAMPLES
}
fn default_early_stop_threshold() -> f64 {
    0.95
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            sticky_ttl_secs: default_sticky_ttl_secs(),
            bandit_ttl_secs: default_bandit_ttl_secs(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

impl Default for BanditSettings {
    fn default() -> Self {
        Self {
            ucb_exploration: default_ucb_exploration(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            monte_carlo_samples: default_monte_carlo_samples(),
            early_stop_threshold: default_early_stop_threshold(),
            reward_value_threshold: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            experiments: ExperimentsConfig::default(),
            traffic: TrafficSettings::default(),
            bandit: BanditSettings::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file, then environment variables.
    /// Environment wins over the file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("PISCES")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut app: AppConfig = config.try_deserialize()?;
        app.normalize();
        Ok(app)
    }

    fn normalize(&mut self) {
        if self.analysis.monte_carlo_samples < MIN_MONTE_CARLO_SAMPLES {
            tracing::warn!(
                configured = self.analysis.monte_carlo_samples,
                minimum = MIN_MONTE_CARLO_SAMPLES,
                "Monte Carlo sample count raised to minimum"
            );
            self.analysis.monte_carlo_samples = MIN_MONTE_CARLO_SAMPLES;
        }

        // Must lie strictly inside (0.5, 1.0); NaN fails both comparisons.
        let threshold = self.analysis.early_stop_threshold;
        if !(threshold > 0.5 && threshold < 1.0) {
            tracing::warn!(
                configured = threshold,
                fallback = default_early_stop_threshold(),
                "Early-stop threshold outside (0.5, 1.0), using default"
            );
            self.analysis.early_stop_threshold = default_early_stop_threshold();
        }

        let exploration = self.bandit.ucb_exploration;
        if !(exploration.is_finite() && exploration > 0.0) {
            tracing::warn!(
                configured = exploration,
                fallback = default_ucb_exploration(),
                "UCB exploration constant must be positive, using default"
            );
            self.bandit.ucb_exploration = default_ucb_exploration();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.redis.sticky_ttl_secs, 30 * 24 * 3600);
        assert!((config.bandit.ucb_exploration - 2.0).abs() < f64::EPSILON);
        assert!((config.analysis.early_stop_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.analysis.monte_carlo_samples, 10_000);
        assert_eq!(config.experiments.cache_ttl_ms, 0);
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let json = r#"{
            "storage": {"backend": "redis", "redis": {"url": "redis://cache:6379"}},
            "analysis": {"monte_carlo_samples": 500, "reward_value_threshold": 4500.0}
        }"#;
        let mut config: AppConfig = serde_json::from_str(json).unwrap();
        config.normalize();
        assert_eq!(config.storage.backend, StorageBackend::Redis);
        assert_eq!(config.storage.redis.url, "redis://cache:6379");
        assert_eq!(config.storage.redis.connect_timeout_ms, 5000);
        assert_eq!(config.analysis.monte_carlo_samples, MIN_MONTE_CARLO_SAMPLES);
        assert_eq!(config.analysis.reward_value_threshold, Some(4500.0));
        assert_eq!(config.node_id, "node-01");
    }

    #[test]
    fn test_out_of_range_threshold_falls_back_to_default() {
        for threshold in ["1.0", "0.5", "0.2", "1.7"] {
            let json = format!(r#"{{"analysis": {{"early_stop_threshold": {threshold}}}}}"#);
            let mut config: AppConfig = serde_json::from_str(&json).unwrap();
            config.normalize();
            assert!(
                (config.analysis.early_stop_threshold - 0.95).abs() < f64::EPSILON,
                "threshold {threshold} was kept"
            );
        }

        let mut config = AppConfig::default();
        config.analysis.early_stop_threshold = f64::NAN;
        config.normalize();
        assert!((config.analysis.early_stop_threshold - 0.95).abs() < f64::EPSILON);

        config.analysis.early_stop_threshold = 0.9;
        config.normalize();
        assert!((config.analysis.early_stop_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_positive_exploration_falls_back_to_default() {
        for exploration in [0.0, -1.5, f64::INFINITY, f64::NAN] {
            let mut config = AppConfig::default();
            config.bandit.ucb_exploration = exploration;
            config.normalize();
            assert!(
                (config.bandit.ucb_exploration - 2.0).abs() < f64::EPSILON,
                "exploration {exploration} was kept"
            );
        }

        let mut config = AppConfig::default();
        config.bandit.ucb_exploration = 0.5;
        config.normalize();
        assert!((config.bandit.ucb_exploration - 0.5).abs() < f64::EPSILON);
    }
}
