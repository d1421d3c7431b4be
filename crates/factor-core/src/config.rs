//! factord.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub autoscale: AutoscaleConfig,
    pub telemetry: TelemetryConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Address workers use to call back with results.
    pub public_ip: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            public_ip: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub port: u16,
    pub grace_period: String,
    pub provision_timeout: String,
    pub poll_interval: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            grace_period: "60s".to_string(),
            provision_timeout: "120s".to_string(),
            poll_interval: "2s".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn grace_period(&self) -> Duration {
        parse_duration(&self.grace_period).unwrap_or(Duration::from_secs(60))
    }

    pub fn provision_timeout(&self) -> Duration {
        parse_duration(&self.provision_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(2))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Known-expensive inputs that would push the least-loaded worker to
    /// this score get a fresh worker instead.
    pub complexity_threshold: i64,
    /// Flat score added for each running job with no historical record.
    pub unknown_job_penalty: i64,
    /// Multiplier applied to the integer CPU utilization percentage.
    pub cpu_weight: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 1000,
            unknown_job_penalty: 100,
            cpu_weight: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    /// How long a drain request stays in force before it is treated as stale.
    pub fn drain_timeout(&self) -> Duration {
        self.interval() * 3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval: String,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Mean CPU percent above which a worker is added.
    pub scale_up_cpu: f64,
    /// Mean CPU percent below which a worker is retired.
    pub scale_down_cpu: f64,
    pub scale_up_window: String,
    pub scale_down_window: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            min_workers: 1,
            max_workers: 10,
            scale_up_cpu: 70.0,
            scale_down_cpu: 20.0,
            scale_up_window: "60s".to_string(),
            scale_down_window: "300s".to_string(),
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn scale_up_window(&self) -> Duration {
        parse_duration(&self.scale_up_window).unwrap_or(Duration::from_secs(60))
    }

    pub fn scale_down_window(&self) -> Duration {
        parse_duration(&self.scale_down_window).unwrap_or(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Pool of pre-running worker hosts handed out by the static provider.
    pub addresses: Vec<String>,
}

impl FactorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FactorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("worker.grace_period", &self.worker.grace_period),
            ("worker.provision_timeout", &self.worker.provision_timeout),
            ("worker.poll_interval", &self.worker.poll_interval),
            ("health.interval", &self.health.interval),
            ("autoscale.interval", &self.autoscale.interval),
            ("autoscale.scale_up_window", &self.autoscale.scale_up_window),
            ("autoscale.scale_down_window", &self.autoscale.scale_down_window),
            ("telemetry.interval", &self.telemetry.interval),
        ];
        for (key, value) in durations {
            if parse_duration(value).is_none() {
                anyhow::bail!("{key}: invalid duration {value:?}");
            }
        }
        if self.autoscale.max_workers == 0 {
            anyhow::bail!("autoscale.max_workers must be at least 1");
        }
        if self.autoscale.min_workers > self.autoscale.max_workers {
            anyhow::bail!(
                "autoscale.min_workers ({}) exceeds max_workers ({})",
                self.autoscale.min_workers,
                self.autoscale.max_workers
            );
        }
        if self.autoscale.scale_down_cpu >= self.autoscale.scale_up_cpu {
            anyhow::bail!("autoscale.scale_down_cpu must be below scale_up_cpu");
        }
        Ok(())
    }
}

/// Parse a duration string like `"500ms"`, `"30s"` or `"5m"`.
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config: FactorConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.port, 8000);
        assert_eq!(config.dispatch.complexity_threshold, 1000);
        assert_eq!(config.dispatch.unknown_job_penalty, 100);
        assert_eq!(config.dispatch.cpu_weight, 10);
        assert_eq!(config.health.interval(), Duration::from_secs(30));
        assert_eq!(config.health.drain_timeout(), Duration::from_secs(90));
        assert!(config.provider.addresses.is_empty());
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[dispatch]
complexity_threshold = 5000

[worker]
grace_period = "0s"

[provider]
addresses = ["10.0.0.1", "10.0.0.2"]
"#;
        let config: FactorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch.complexity_threshold, 5000);
        assert_eq!(config.dispatch.unknown_job_penalty, 100);
        assert_eq!(config.worker.grace_period(), Duration::ZERO);
        assert_eq!(config.provider.addresses.len(), 2);
    }

    #[test]
    fn default_config_is_valid() {
        FactorConfig::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut config = FactorConfig::default();
        config.health.interval = "soon".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("health.interval"), "{err}");

        let mut config = FactorConfig::default();
        config.autoscale.min_workers = 5;
        config.autoscale.max_workers = 2;
        assert!(config.validate().is_err());

        let mut config = FactorConfig::default();
        config.autoscale.scale_down_cpu = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9090\npublic_ip = \"203.0.113.7\"").unwrap();

        let config = FactorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.public_ip, "203.0.113.7");
    }

    #[test]
    fn from_file_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(FactorConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn serialized_defaults_parse_back() {
        let toml_str = FactorConfig::default().to_toml_string().unwrap();
        assert!(toml_str.contains("complexity_threshold"));
        let config: FactorConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.autoscale.max_workers, 10);
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
    }
}
