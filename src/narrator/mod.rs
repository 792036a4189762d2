//! Narrative generator adapter: prompt, timeout, retry and fallback around a
//! [`TextGenerator`].

pub mod client;
pub mod parse;
/// Prompt construction from region, history and action.
pub mod prompt;

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    state::session::{START_ACTION, StorySegment},
};

pub use self::client::{
    ChatCompletionsGenerator, ChatMessage, GenerationError, TextGenerator, UnconfiguredGenerator,
};
use self::parse::{FILLER_OPTIONS, parse_reply};

/// Where a beat's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatSource {
    /// Parsed from the generator's reply.
    Generated,
    /// Built locally after the generator failed.
    Fallback,
}

/// Narrative text plus exactly three options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeBeat {
    /// Narrative text.
    pub text: String,
    /// Next choices, always three.
    pub options: Vec<String>,
    /// Whether the generator produced it.
    pub source: BeatSource,
}

/// Turns a region, recent history and a chosen action into the next beat. Never fails.
pub struct Narrator {
    generator: Arc<dyn TextGenerator>,
    regions: IndexMap<String, String>,
    history_window: usize,
    call_timeout: Duration,
}

impl Narrator {
    /// Narrator using the regions, history window and timeout of `config`.
    pub fn new(generator: Arc<dyn TextGenerator>, config: &AppConfig) -> Self {
        Self {
            generator,
            regions: config.regions.clone(),
            history_window: config.history_window,
            call_timeout: config.generation_timeout,
        }
    }

    /// Generate with the configured window, retry once with a single segment of
    /// context, then fall back to a fixed region-flavored beat.
    pub async fn narrate(
        &self,
        region: &str,
        history: &[StorySegment],
        action: &str,
    ) -> NarrativeBeat {
        for (attempt, window) in [(1, self.history_window), (2, 1)] {
            match self.attempt(region, history, action, window).await {
                Ok(beat) => return beat,
                Err(err) => warn!(
                    region,
                    attempt,
                    window,
                    error = %err,
                    "narration attempt failed"
                ),
            }
        }
        self.fallback(region, action)
    }

    async fn attempt(
        &self,
        region: &str,
        history: &[StorySegment],
        action: &str,
        window: usize,
    ) -> Result<NarrativeBeat, GenerationError> {
        let recent = &history[history.len().saturating_sub(window)..];
        let flavor = self.regions.get(region).map_or("", String::as_str);
        let messages = prompt::build_messages(region, flavor, recent, action);

        let raw = timeout(self.call_timeout, self.generator.generate(messages))
            .await
            .map_err(|_| GenerationError::Timeout)??;
        let parsed =
            parse_reply(&raw).map_err(|err| GenerationError::Unparseable(err.to_string()))?;
        debug!(region, window, "narration generated");

        Ok(NarrativeBeat {
            text: parsed.text,
            options: parsed.options,
            source: BeatSource::Generated,
        })
    }

    /// Fixed beat used when generation keeps failing.
    pub fn fallback(&self, region: &str, action: &str) -> NarrativeBeat {
        let place = match self.regions.get(region) {
            Some(flavor) if !flavor.is_empty() => flavor.clone(),
            _ => format!("the {region}"),
        };
        let text = if action == START_ACTION {
            format!(
                "The group gathers at the edge of {place}. The way ahead is unclear, \
                 but every journey starts with a single step."
            )
        } else {
            format!(
                "The group decides to {}. For a while {place} stays quiet, \
                 and the path ahead remains open.",
                action.trim_end_matches('.').to_lowercase()
            )
        };
        NarrativeBeat {
            text,
            options: FILLER_OPTIONS.iter().map(|option| option.to_string()).collect(),
            source: BeatSource::Fallback,
        }
    }
}
