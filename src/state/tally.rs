//! Pure vote counting and tally readiness checks.

use std::time::SystemTime;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::session::VoteRound;

/// What asked for a tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TallyTrigger {
    /// Every current participant has voted.
    AllVoted,
    /// The round deadline elapsed.
    Deadline,
}

/// Outcome of counting one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyResult {
    /// Winning option.
    pub winner: String,
    /// Votes per option, ordered like the round's options.
    pub counts: IndexMap<String, u32>,
    /// Votes that named one of the options.
    pub total_votes: u32,
}

/// Count `votes` against `options` and pick the winner.
///
/// The strictly highest count wins; ties go to the option listed first, which
/// makes an empty ballot pick `options[0]`. Votes naming no option are ignored.
/// Returns `None` only when `options` is empty.
pub fn tally<'a, I>(votes: I, options: &[String]) -> Option<TallyResult>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: IndexMap<String, u32> =
        options.iter().map(|option| (option.clone(), 0)).collect();
    let mut total_votes = 0;
    for choice in votes {
        if let Some(count) = counts.get_mut(choice) {
            *count += 1;
            total_votes += 1;
        }
    }

    let mut best: Option<(&String, u32)> = None;
    for (option, &count) in &counts {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((option, count));
        }
    }
    let winner = best?.0.clone();

    Some(TallyResult {
        winner,
        counts,
        total_votes,
    })
}

/// Whether `round` stopped accepting votes at `now`.
pub fn deadline_elapsed(round: &VoteRound, now: SystemTime) -> bool {
    now >= round.deadline
}

/// Whether every participant has a vote in `round`. An empty session never qualifies.
pub fn all_voted<'a, I>(participants: I, round: &VoteRound) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let mut participants = participants.into_iter().peekable();
    participants.peek().is_some() && participants.all(|user| round.votes.contains_key(user))
}

impl TallyTrigger {
    /// Whether this trigger's condition currently holds.
    pub fn is_satisfied<'a, I>(self, participants: I, round: &VoteRound, now: SystemTime) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        match self {
            TallyTrigger::Deadline => deadline_elapsed(round, now),
            // A tally that would run anyway once the deadline passed is ready early too.
            TallyTrigger::AllVoted => {
                all_voted(participants, round) || deadline_elapsed(round, now)
            }
        }
    }
}
