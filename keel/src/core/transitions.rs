//! Static legality tables for lifecycle transitions.
//!
//! The adjacency table and the intent table are both exhaustive `match`es so a
//! new [`AgentState`] or [`TaskIntent`] variant cannot compile until it has
//! been placed in every table.

use thiserror::Error;

use crate::core::types::AgentState as S;
use crate::core::types::{AgentState, TaskIntent};

const F: [AgentState; 5] = AgentState::FAILURES;

/// Why a requested transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionRejection {
    #[error("{from} is terminal; no transition to {to} is possible")]
    FromTerminal { from: AgentState, to: AgentState },
    #[error("illegal transition {from} -> {to}")]
    NotAdjacent { from: AgentState, to: AgentState },
    #[error("intent {intent} may never reach {to}")]
    IntentRestricted { intent: TaskIntent, to: AgentState },
}

/// Non-failure successors of `from`. Every non-terminal state may also move to
/// any failure state.
fn forward_targets(from: AgentState) -> &'static [AgentState] {
    match from {
        S::Idle => &[S::IntentAnalysis],
        S::IntentAnalysis => &[S::RepoDiscovery, S::Implementing, S::FeedbackWait],
        S::RepoDiscovery => &[S::Planning],
        S::Planning => &[
            S::TaskIsolation,
            S::Researching,
            S::Implementing,
            S::FeedbackWait,
        ],
        S::TaskIsolation => &[S::ProvingGround, S::Implementing],
        S::ProvingGround => &[S::Implementing],
        S::Researching => &[S::ImpactAnalysis, S::Planning],
        S::ImpactAnalysis => &[S::Implementing, S::FeedbackWait],
        S::Implementing => &[S::Verifying],
        S::Verifying => &[S::Complete, S::Retrying, S::FeedbackWait],
        S::FeedbackWait => &[
            S::Implementing,
            S::Planning,
            S::IntentAnalysis,
            S::Complete,
        ],
        S::Retrying => &[S::Researching, S::Implementing],
        S::Complete
        | S::Failed
        | S::FailedByStale
        | S::FailedByInterrupt
        | S::FailedByTimeout
        | S::FailedByScope => &[],
    }
}

/// True when `(from, to)` is in the adjacency table.
pub fn is_adjacent(from: AgentState, to: AgentState) -> bool {
    if from.is_terminal() {
        return false;
    }
    forward_targets(from).contains(&to) || F.contains(&to)
}

/// All legal successors of `from`, forward targets first.
pub fn successors(from: AgentState) -> Vec<AgentState> {
    if from.is_terminal() {
        return Vec::new();
    }
    let mut out = forward_targets(from).to_vec();
    out.extend(F);
    out
}

/// True when `intent` may ever reach `to`.
pub fn intent_allows(intent: TaskIntent, to: AgentState) -> bool {
    match intent {
        TaskIntent::Explain => {
            matches!(
                to,
                S::Idle | S::IntentAnalysis | S::RepoDiscovery | S::Researching | S::Complete
            ) || to.is_failure()
        }
        TaskIntent::Fix | TaskIntent::Develop | TaskIntent::Generate | TaskIntent::Meta => true,
    }
}

/// Check both tables. `intent` is `None` until the intent has been classified.
pub fn validate_transition(
    from: AgentState,
    to: AgentState,
    intent: Option<TaskIntent>,
) -> Result<(), TransitionRejection> {
    if from.is_terminal() {
        return Err(TransitionRejection::FromTerminal { from, to });
    }
    if !is_adjacent(from, to) {
        return Err(TransitionRejection::NotAdjacent { from, to });
    }
    if let Some(intent) = intent
        && !intent_allows(intent, to)
    {
        return Err(TransitionRejection::IntentRestricted { intent, to });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTENTS: [TaskIntent; 5] = [
        TaskIntent::Fix,
        TaskIntent::Develop,
        TaskIntent::Explain,
        TaskIntent::Generate,
        TaskIntent::Meta,
    ];

    #[test]
    fn terminal_states_have_no_successors() {
        for state in AgentState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(successors(state).is_empty(), "{state} has successors");
            for target in AgentState::ALL {
                assert!(validate_transition(state, target, None).is_err());
            }
        }
    }

    #[test]
    fn every_non_terminal_state_can_fail_every_way() {
        for state in AgentState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            for failure in AgentState::FAILURES {
                assert!(is_adjacent(state, failure), "{state} -> {failure}");
            }
        }
    }

    #[test]
    fn explain_never_reaches_implementing() {
        for from in AgentState::ALL {
            assert!(matches!(
                validate_transition(from, AgentState::Implementing, Some(TaskIntent::Explain)),
                Err(_)
            ));
        }
        assert_eq!(
            validate_transition(
                AgentState::IntentAnalysis,
                AgentState::Implementing,
                Some(TaskIntent::Explain)
            ),
            Err(TransitionRejection::IntentRestricted {
                intent: TaskIntent::Explain,
                to: AgentState::Implementing
            })
        );
    }

    /// Legality is exactly adjacency AND (no intent OR intent allows target).
    #[test]
    fn validate_matches_table_definition_for_all_triples() {
        for from in AgentState::ALL {
            for to in AgentState::ALL {
                let adjacent = !from.is_terminal()
                    && (forward_targets(from).contains(&to) || to.is_failure());
                assert_eq!(validate_transition(from, to, None).is_ok(), adjacent);
                for intent in INTENTS {
                    let expected = adjacent && intent_allows(intent, to);
                    assert_eq!(
                        validate_transition(from, to, Some(intent)).is_ok(),
                        expected,
                        "{from} -> {to} under {intent}"
                    );
                }
            }
        }
    }

    #[test]
    fn happy_fix_path_is_legal() {
        let path = [
            AgentState::Idle,
            AgentState::IntentAnalysis,
            AgentState::RepoDiscovery,
            AgentState::Planning,
            AgentState::TaskIsolation,
            AgentState::Implementing,
            AgentState::Verifying,
            AgentState::Complete,
        ];
        for pair in path.windows(2) {
            validate_transition(pair[0], pair[1], Some(TaskIntent::Fix)).expect("legal");
        }
    }

    #[test]
    fn feedback_wait_is_optional_not_mandatory() {
        assert!(is_adjacent(AgentState::IntentAnalysis, AgentState::FeedbackWait));
        assert!(is_adjacent(AgentState::IntentAnalysis, AgentState::RepoDiscovery));
    }
}
