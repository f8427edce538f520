use anyhow::{anyhow, Context};
use config::Config as CConfig;
use serde::Deserialize;
use tokio::time::Duration;

const ENV_PREFIX: &str = "LOADTEST";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub url: String,
    pub rooms: u64,
    pub messages: usize,
    pub target_vus: usize,
    pub start_vus: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub send_delay: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub graceful_stop: Duration,
    /// When left out, the default ramp is built from `target_vus`.
    pub stages: Option<Vec<Stage>>,
}

impl Config {
    /// Loads the config file at `path` (it may be missing) and applies `LOADTEST_*`
    /// environment overrides on top of it.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let c = CConfig::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        let config: Self = c.try_deserialize()?;
        config.validate()?;
        if std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var("RUST_LOG", &config.log_level);
        }
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.rooms == 0 {
            return Err(anyhow!("rooms must be at least 1"));
        }
        if self.stages().is_empty() {
            return Err(anyhow!("at least one stage is required"));
        }
        Ok(())
    }

    pub fn stages(&self) -> Vec<Stage> {
        match &self.stages {
            Some(stages) => stages.clone(),
            None => vec![
                Stage::new(Duration::from_secs(30), self.target_vus),
                Stage::new(Duration::from_secs(60), self.target_vus),
                // Same target as the previous stage: a plateau, not a ramp-down.
                Stage::new(Duration::from_secs(5), self.target_vus),
            ],
        }
    }

    /// Total time covered by all stages, not counting the graceful stop.
    pub fn total_duration(&self) -> Duration {
        self.stages().iter().map(|stage| stage.duration).sum()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            url: "ws://localhost:6789".to_string(),
            rooms: 10,
            messages: 10,
            target_vus: 60,
            start_vus: 1,
            send_delay: Duration::from_millis(1000),
            graceful_stop: Duration::from_secs(30),
            stages: None,
        }
    }
}

/// A time window during which the number of VUs moves linearly towards `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Stage {
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parses durations such as `500ms`, `30s`, `2m`, `1h` or `1m30s`.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("duration {:?} is missing a unit", raw))?;
        if digits == 0 {
            return Err(anyhow!("duration {:?} has a unit without a value", raw));
        }
        let value: u64 = rest[..digits]
            .parse()
            .with_context(|| format!("invalid duration {:?}", raw))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            unit => return Err(anyhow!("unknown duration unit {:?} in {:?}", unit, raw)),
        };
        total += part;
        rest = &rest[unit_len..];
    }
    Ok(total)
}
