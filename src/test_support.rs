//! Fakes shared by the unit tests: a settable clock, scripted text generators and a
//! ready-to-use application state over the in-memory store.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::{SessionStore, memory::MemorySessionStore},
    narrator::{ChatMessage, GenerationError, TextGenerator},
    state::{AppState, Clock, SharedState, session::StorySession, transitions::load_session},
};

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Generator returning scripted replies, then `{"text": "Scene N", "options": [A, B, C]}`.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    calls: Arc<AtomicUsize>,
    replies: Arc<Mutex<VecDeque<String>>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies
            .lock()
            .unwrap()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'static, Result<String, GenerationError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = self.replies.lock().unwrap().pop_front();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(reply.unwrap_or_else(|| {
                format!(r#"{{"text": "Scene {call}", "options": ["A", "B", "C"]}}"#)
            }))
        })
    }
}

/// Generator whose every call fails.
#[derive(Default)]
pub struct FailingGenerator {
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for FailingGenerator {
    fn generate(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'static, Result<String, GenerationError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(GenerationError::Status {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                message: "boom".into(),
            })
        })
    }
}

/// Configuration with a silent timer jitter and a short generation timeout.
pub fn test_config() -> AppConfig {
    AppConfig {
        timer_jitter: Duration::ZERO,
        generation_timeout: Duration::from_millis(500),
        ..AppConfig::default()
    }
}

/// Application state wired to an in-memory store and a manual clock.
pub struct Harness {
    pub state: SharedState,
    pub store: MemorySessionStore,
    pub clock: Arc<ManualClock>,
    pub generator: ScriptedGenerator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(test_config(), ScriptedGenerator::new()).await
    }

    pub async fn with(config: AppConfig, generator: ScriptedGenerator) -> Self {
        let clock = Arc::new(ManualClock::new(SystemTime::now()));
        let store = MemorySessionStore::new();
        let state = AppState::with_clock(config, Arc::new(generator.clone()), clock.clone());
        state.install_session_store(Arc::new(store.clone())).await;
        Self {
            state,
            store,
            clock,
            generator,
        }
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::new(self.store.clone())
    }

    pub async fn session(&self, session_id: Uuid) -> StorySession {
        load_session(&self.store(), session_id).await.unwrap()
    }

    /// Poll the stored session until `done` holds; panics after two seconds.
    pub async fn wait_for<F>(&self, session_id: Uuid, done: F) -> StorySession
    where
        F: Fn(&StorySession) -> bool,
    {
        let poll = async {
            loop {
                let session = self.session(session_id).await;
                if done(&session) {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .expect("session never reached the expected state")
    }
}
