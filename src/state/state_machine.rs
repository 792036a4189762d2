use thiserror::Error;

/// Lifecycle phases of a story session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Not stored yet.
    Uninitialized,
    /// Stored with an empty history; the opening segment is pending.
    Opening,
    /// A vote round is open.
    Voting,
    /// A tally claim was taken; the next segment is being generated.
    Tallying,
    /// Externally completed: votes and tallies are rejected.
    Completed,
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First participant requested a region without an active session.
    Create,
    /// The opening segment was appended and its round opened.
    PublishOpening,
    /// A tally claim was won for the open round.
    ClaimTally,
    /// The tally result was appended and the next round opened.
    AppendSegment,
    /// History cleared under a new epoch.
    Restart,
    /// External completion signal.
    Complete,
    /// A participant joined.
    Join,
    /// A participant left.
    Leave,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: LifecycleEvent,
}

/// Errors that can occur when applying a planned transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// State machine phase changed since the plan was created.
    #[error("phase changed from {expected:?} to {actual:?} since the plan was made")]
    PhaseMismatch {
        /// Phase the plan was made from.
        expected: SessionPhase,
        /// Phase the machine is in now.
        actual: SessionPhase,
    },
    /// State machine version changed since the plan was created.
    #[error("version moved to {actual} while the plan expected {expected}")]
    VersionMismatch { expected: u64, actual: u64 },
}

/// A validated transition that has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Phase the plan starts from.
    pub from: SessionPhase,
    /// Phase after applying.
    pub to: SessionPhase,
    /// Event that caused the transition.
    pub event: LifecycleEvent,
    /// Version number after applying this transition.
    pub version_next: u64,
}

/// Per-session transition function, resumed from a stored session for every write.
///
/// `base_version` is the stored version the machine was resumed from: the value a
/// compare-and-swap must expect when the resulting session is written back.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    version: u64,
    base_version: u64,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            version: 0,
            base_version: 0,
        }
    }
}

impl SessionStateMachine {
    /// Create a machine for a session that does not exist yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a stored session's derived phase and version.
    pub fn resume(phase: SessionPhase, version: u64) -> Self {
        Self {
            phase,
            version,
            base_version: version,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Version after the transitions fired so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version the store must still hold for a write of this machine's result to succeed.
    pub fn expected_version(&self) -> u64 {
        self.base_version
    }

    /// Whether any event was applied since the machine was resumed.
    pub fn is_dirty(&self) -> bool {
        self.version != self.base_version
    }

    /// Validate `event` against the current phase without changing anything.
    pub fn plan(&self, event: LifecycleEvent) -> Result<Plan, InvalidTransition> {
        let to = self.compute_transition(event)?;
        Ok(Plan {
            from: self.phase,
            to,
            event,
            version_next: self.version + 1,
        })
    }

    /// Apply a previously computed plan, returning the new phase.
    pub fn apply(&mut self, plan: Plan) -> Result<SessionPhase, ApplyError> {
        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }
        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }
        self.phase = plan.to;
        self.version = plan.version_next;
        Ok(self.phase)
    }

    /// Plan and apply in one step.
    pub fn fire(&mut self, event: LifecycleEvent) -> Result<SessionPhase, InvalidTransition> {
        let plan = self.plan(event)?;
        self.phase = plan.to;
        self.version = plan.version_next;
        Ok(self.phase)
    }

    fn compute_transition(&self, event: LifecycleEvent) -> Result<SessionPhase, InvalidTransition> {
        use LifecycleEvent as E;
        use SessionPhase as P;

        let next = match (self.phase, event) {
            (P::Uninitialized, E::Create) => P::Opening,
            (P::Opening, E::PublishOpening) => P::Voting,
            (P::Voting, E::ClaimTally) => P::Tallying,
            (P::Tallying, E::AppendSegment) => P::Voting,
            (P::Opening | P::Voting | P::Tallying, E::Restart) => P::Opening,
            (P::Opening | P::Voting | P::Tallying, E::Complete) => P::Completed,
            (phase @ (P::Opening | P::Voting | P::Tallying), E::Join) => phase,
            (phase @ (P::Opening | P::Voting | P::Tallying | P::Completed), E::Leave) => phase,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
