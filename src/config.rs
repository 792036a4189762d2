//! Application-level configuration loading: regions, voting window and tally timings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "STORY_SESSION_CONFIG_PATH";

const DEFAULT_VOTING_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(90);
const DEFAULT_TIMER_JITTER: Duration = Duration::from_millis(250);
const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_HISTORY_WINDOW: usize = 3;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
/// Headroom kept between the two generation attempts and the claim expiry.
const CLAIM_TTL_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Region name to the flavor text handed to the narrator, in declaration order.
    pub regions: IndexMap<String, String>,
    /// How long a round stays open for votes.
    pub voting_window: Duration,
    /// Lifetime of a held tally claim before another trigger may take it over.
    pub claim_ttl: Duration,
    /// Upper bound of the random delay added to every deadline timer.
    pub timer_jitter: Duration,
    /// Timeout of a single text-generation call.
    pub generation_timeout: Duration,
    /// Number of trailing segments included in a prompt.
    pub history_window: usize,
    /// Capacity of each per-session broadcast topic.
    pub channel_capacity: usize,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        regions = app_config.regions.len(),
                        voting_window_ms = app_config.voting_window.as_millis() as u64,
                        "loaded story session config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Flavor text of a configured region.
    pub fn region_flavor(&self, region: &str) -> Option<&str> {
        self.regions.get(region).map(String::as_str)
    }

    /// Enforce that a claim outlives both generation attempts of its holder.
    fn normalized(mut self) -> Self {
        let floor = self.generation_timeout * 2 + CLAIM_TTL_MARGIN;
        if self.claim_ttl < floor {
            warn!(
                configured_ms = self.claim_ttl.as_millis() as u64,
                floor_ms = floor.as_millis() as u64,
                "claim_ttl shorter than two generation attempts; raising it"
            );
            self.claim_ttl = floor;
        }
        self.history_window = self.history_window.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            voting_window: DEFAULT_VOTING_WINDOW,
            claim_ttl: DEFAULT_CLAIM_TTL,
            timer_jitter: DEFAULT_TIMER_JITTER,
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            history_window: DEFAULT_HISTORY_WINDOW,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    regions: Vec<RawRegion>,
    #[serde_as(as = "DurationSeconds<u64>")]
    voting_window_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    claim_ttl_secs: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    timer_jitter_ms: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    generation_timeout_ms: Duration,
    history_window: usize,
    channel_capacity: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        let defaults = AppConfig::default();
        Self {
            regions: Vec::new(),
            voting_window_secs: defaults.voting_window,
            claim_ttl_secs: defaults.claim_ttl,
            timer_jitter_ms: defaults.timer_jitter,
            generation_timeout_ms: defaults.generation_timeout,
            history_window: defaults.history_window,
            channel_capacity: defaults.channel_capacity,
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of a region entry.
struct RawRegion {
    name: String,
    #[serde(default)]
    flavor: String,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let regions = if value.regions.is_empty() {
            default_regions()
        } else {
            value
                .regions
                .into_iter()
                .map(|region| (region.name, region.flavor))
                .collect()
        };
        Self {
            regions,
            voting_window: value.voting_window_secs,
            claim_ttl: value.claim_ttl_secs,
            timer_jitter: value.timer_jitter_ms,
            generation_timeout: value.generation_timeout_ms,
            history_window: value.history_window,
            channel_capacity: value.channel_capacity,
        }
        .normalized()
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Built-in regions shipped with the binary.
fn default_regions() -> IndexMap<String, String> {
    [
        (
            "forest",
            "an ancient, whispering forest where the trees remember every traveller",
        ),
        (
            "desert",
            "a sun-bleached desert of shifting dunes and buried ruins",
        ),
        (
            "harbor",
            "a fog-bound harbor town full of smugglers and sea shanties",
        ),
        (
            "mountain",
            "a storm-wrapped mountain pass guarded by old stone sentinels",
        ),
    ]
    .into_iter()
    .map(|(name, flavor)| (name.to_owned(), flavor.to_owned()))
    .collect()
}
