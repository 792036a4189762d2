/// Publish/subscribe fan-out.
pub mod channel;
/// Time source.
pub mod clock;
/// Domain model of a story session.
pub mod session;
/// Lifecycle transition table.
pub mod state_machine;
pub mod tally;
/// Compare-and-swap session writes.
pub mod transitions;

use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use tokio::{sync::RwLock, sync::watch, task::AbortHandle};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::SessionStore,
    error::ServiceError,
    narrator::{Narrator, TextGenerator},
};

pub use self::channel::{MessageChannel, TopicHub, session_topic};
pub use self::clock::{Clock, SystemClock};
pub use self::state_machine::{ApplyError, InvalidTransition, LifecycleEvent, Plan, SessionPhase};

/// Cheaply cloneable handle to [`AppState`].
pub type SharedState = Arc<AppState>;

/// Deadline timer armed for the open round of one session.
pub struct RoundTimer {
    /// Round the timer fires for.
    pub round_id: Uuid,
    /// Cancels the timer task.
    pub handle: AbortHandle,
}

/// Central application state: storage handle, fan-out channel, narrator and the
/// per-session deadline timers of this coordinator instance.
pub struct AppState {
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    degraded: watch::Sender<bool>,
    channel: Arc<dyn MessageChannel>,
    narrator: Narrator,
    clock: Arc<dyn Clock>,
    config: AppConfig,
    timers: DashMap<Uuid, RoundTimer>,
    instance_id: String,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig, generator: Arc<dyn TextGenerator>) -> SharedState {
        Self::with_clock(config, generator, Arc::new(SystemClock))
    }

    /// Like [`AppState::new`], reading time from `clock`.
    pub fn with_clock(
        config: AppConfig,
        generator: Arc<dyn TextGenerator>,
        clock: Arc<dyn Clock>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            session_store: RwLock::new(None),
            degraded: degraded_tx,
            channel: Arc::new(TopicHub::new(config.channel_capacity)),
            narrator: Narrator::new(generator, &config),
            clock,
            config,
            timers: DashMap::new(),
            instance_id: Uuid::new_v4().simple().to_string(),
        })
    }

    /// Obtain a handle to the current session store, if one is installed.
    pub async fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.session_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current session store, or [`ServiceError::Degraded`] while none is usable.
    pub async fn require_session_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        if *self.degraded.borrow() {
            return Err(ServiceError::Degraded);
        }
        self.session_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new session store implementation and leave degraded mode.
    pub async fn install_session_store(&self, store: Arc<dyn SessionStore>) {
        {
            let mut guard = self.session_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current session store and enter degraded mode.
    pub async fn clear_session_store(&self) {
        {
            let mut guard = self.session_store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update the degraded flag, notifying watchers only when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Fan-out for session events.
    pub fn channel(&self) -> &dyn MessageChannel {
        self.channel.as_ref()
    }

    /// Narrative generator adapter.
    pub fn narrator(&self) -> &Narrator {
        &self.narrator
    }

    /// Time source shared by timers and claims.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Current time of the configured clock.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Deadline timers armed by this instance, keyed by session id.
    pub fn timers(&self) -> &DashMap<Uuid, RoundTimer> {
        &self.timers
    }

    /// Identifier written as the holder of claims taken by this instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
