use anyhow::Context;
use faceguard_core::enrollment::{
    DEFAULT_ATTEMPT_INTERVAL, DEFAULT_MAX_ATTEMPTS, DEFAULT_SAMPLES_PER_POSE,
};
use faceguard_core::monitor::DEFAULT_POLL_INTERVAL;
use faceguard_core::{
    DetectorFaultPolicy, EnrollmentConfig, EuclideanMatcher, MonitorConfig, Pose,
    DEFAULT_MATCH_THRESHOLD,
};
use faceguard_store::StoreKey;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration: defaults, then the TOML file, then `FACEGUARD_*`
/// environment variables.
#[derive(Clone)]
pub struct Config {
    /// Path to the SQLite credential store.
    pub db_path: PathBuf,
    /// JSON observation file written by the external detector.
    pub feed_path: PathBuf,
    /// A feed older than this counts as detector unavailable (0 = never stale).
    pub feed_max_age_ms: u64,
    /// Dimension of descriptors produced by the external detector.
    pub descriptor_dimension: usize,
    /// Euclidean distance below which a face matches the owner.
    pub match_threshold: f32,
    /// Delay between the end of one poll and the start of the next.
    pub poll_interval_ms: u64,
    /// Detection attempts per enrollment pose.
    pub enroll_attempts: u32,
    /// Delay between enrollment attempts.
    pub enroll_interval_ms: u64,
    /// Consecutive detections averaged per pose.
    pub samples_per_pose: usize,
    /// Maximum distance between consecutive samples of one pose (unset = no check).
    pub pose_consistency_threshold: Option<f32>,
    /// What a failed detection poll means.
    pub detector_fault_policy: DetectorFaultPolicy,
    /// Secret for the store key; the embedded key is used when unset.
    pub store_secret: Option<String>,
}

/// Optional overrides read from `faceguard.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    feed_path: Option<PathBuf>,
    feed_max_age_ms: Option<u64>,
    descriptor_dimension: Option<usize>,
    match_threshold: Option<f32>,
    poll_interval_ms: Option<u64>,
    enroll_attempts: Option<u32>,
    enroll_interval_ms: Option<u64>,
    samples_per_pose: Option<usize>,
    pose_consistency_threshold: Option<f32>,
    detector_fault_policy: Option<DetectorFaultPolicy>,
    store_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share").join("faceguard");
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        Self {
            db_path: data_dir.join("guard.db"),
            feed_path: runtime_dir.join("faceguard").join("faces.json"),
            feed_max_age_ms: 3000,
            descriptor_dimension: 128,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            enroll_attempts: DEFAULT_MAX_ATTEMPTS,
            enroll_interval_ms: DEFAULT_ATTEMPT_INTERVAL.as_millis() as u64,
            samples_per_pose: DEFAULT_SAMPLES_PER_POSE,
            pose_consistency_threshold: None,
            detector_fault_policy: DetectorFaultPolicy::Alert,
            store_secret: None,
        }
    }
}

impl Config {
    /// Load the full configuration. A missing config file is not an error; a
    /// malformed one is.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        let path = config_file_path();
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config.apply_toml(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_toml(&mut self, text: &str) -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        override_with(&mut self.db_path, file.db_path);
        override_with(&mut self.feed_path, file.feed_path);
        override_with(&mut self.feed_max_age_ms, file.feed_max_age_ms);
        override_with(&mut self.descriptor_dimension, file.descriptor_dimension);
        override_with(&mut self.match_threshold, file.match_threshold);
        override_with(&mut self.poll_interval_ms, file.poll_interval_ms);
        override_with(&mut self.enroll_attempts, file.enroll_attempts);
        override_with(&mut self.enroll_interval_ms, file.enroll_interval_ms);
        override_with(&mut self.samples_per_pose, file.samples_per_pose);
        override_with(&mut self.detector_fault_policy, file.detector_fault_policy);
        if file.pose_consistency_threshold.is_some() {
            self.pose_consistency_threshold = file.pose_consistency_threshold;
        }
        if file.store_secret.is_some() {
            self.store_secret = file.store_secret;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FACEGUARD_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEGUARD_FEED_PATH") {
            self.feed_path = PathBuf::from(v);
        }
        env_override("FACEGUARD_FEED_MAX_AGE_MS", &mut self.feed_max_age_ms);
        env_override("FACEGUARD_DESCRIPTOR_DIMENSION", &mut self.descriptor_dimension);
        env_override("FACEGUARD_MATCH_THRESHOLD", &mut self.match_threshold);
        env_override("FACEGUARD_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env_override("FACEGUARD_ENROLL_ATTEMPTS", &mut self.enroll_attempts);
        env_override("FACEGUARD_ENROLL_INTERVAL_MS", &mut self.enroll_interval_ms);
        env_override("FACEGUARD_SAMPLES_PER_POSE", &mut self.samples_per_pose);
        if let Some(v) = env_parse("FACEGUARD_POSE_CONSISTENCY_THRESHOLD") {
            self.pose_consistency_threshold = Some(v);
        }
        if let Ok(v) = std::env::var("FACEGUARD_DETECTOR_FAULT_POLICY") {
            match parse_fault_policy(&v) {
                Some(policy) => self.detector_fault_policy = policy,
                None => tracing::warn!(value = %v, "unknown FACEGUARD_DETECTOR_FAULT_POLICY; keeping default"),
            }
        }
        if let Ok(v) = std::env::var("FACEGUARD_STORE_SECRET") {
            self.store_secret = Some(v);
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            matcher: EuclideanMatcher::new(self.match_threshold),
            fault_policy: self.detector_fault_policy,
        }
    }

    pub fn enrollment_config(&self) -> EnrollmentConfig {
        EnrollmentConfig {
            poses: Pose::ALL.to_vec(),
            samples_per_pose: self.samples_per_pose,
            max_attempts: self.enroll_attempts,
            attempt_interval: Duration::from_millis(self.enroll_interval_ms),
            consistency_threshold: self.pose_consistency_threshold,
        }
    }

    pub fn store_key(&self) -> StoreKey {
        match &self.store_secret {
            Some(secret) => StoreKey::from_secret(secret.as_bytes()),
            None => StoreKey::embedded(),
        }
    }

    pub fn feed_max_age(&self) -> Option<Duration> {
        (self.feed_max_age_ms > 0).then(|| Duration::from_millis(self.feed_max_age_ms))
    }
}

fn config_file_path() -> PathBuf {
    std::env::var("FACEGUARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("faceguard/faceguard.toml"))
}

fn xdg_dir(var: &str, home_relative: impl AsRef<Path>) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_relative)
    })
}

fn parse_fault_policy(value: &str) -> Option<DetectorFaultPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "alert" => Some(DetectorFaultPolicy::Alert),
        "suppress" => Some(DetectorFaultPolicy::Suppress),
        _ => None,
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    override_with(slot, env_parse(key));
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.enroll_attempts, 15);
        assert_eq!(config.enroll_interval_ms, 500);
        assert_eq!(config.samples_per_pose, 2);
        assert_eq!(config.detector_fault_policy, DetectorFaultPolicy::Alert);
        assert!(config.db_path.ends_with("faceguard/guard.db"));
    }

    #[test]
    fn test_toml_overrides() {
        let mut config = Config::default();
        config
            .apply_toml(
                r#"
                match_threshold = 0.45
                poll_interval_ms = 250
                detector_fault_policy = "suppress"
                pose_consistency_threshold = 0.3
                feed_path = "/run/faceguard/feed.json"
                "#,
            )
            .unwrap();

        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.detector_fault_policy, DetectorFaultPolicy::Suppress);
        assert_eq!(config.pose_consistency_threshold, Some(0.3));
        assert_eq!(config.feed_path, PathBuf::from("/run/faceguard/feed.json"));
        assert_eq!(config.enroll_attempts, 15);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let mut config = Config::default();
        assert!(config.apply_toml("poll_interval = 5").is_err());
    }

    #[test]
    fn test_parse_fault_policy() {
        assert_eq!(parse_fault_policy("Suppress"), Some(DetectorFaultPolicy::Suppress));
        assert_eq!(parse_fault_policy(" alert "), Some(DetectorFaultPolicy::Alert));
        assert_eq!(parse_fault_policy("ignore"), None);
    }

    #[test]
    fn test_derived_configs() {
        let config = Config {
            match_threshold: 0.5,
            poll_interval_ms: 200,
            enroll_attempts: 3,
            feed_max_age_ms: 0,
            ..Config::default()
        };
        let monitor = config.monitor_config();
        assert_eq!(monitor.poll_interval, Duration::from_millis(200));
        assert_eq!(monitor.matcher.threshold, 0.5);

        let enrollment = config.enrollment_config();
        assert_eq!(enrollment.max_attempts, 3);
        assert_eq!(enrollment.poses.len(), 5);

        assert!(config.feed_max_age().is_none());
    }
}
