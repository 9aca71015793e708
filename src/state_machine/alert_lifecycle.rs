//! The alert lifecycle DAG (§4.5 "Lifecycle"): an operator drives an alert
//! from `open` through `acknowledged`/`in_progress` to `closed`. Closed is
//! terminal — reopening is explicitly not permitted; a later match against
//! the same dedup key opens a new alert and records the old one in
//! `related_alert_ids` instead.

use super::{StateMachine, TransitionError, TransitionResult};
use crate::domain::AlertStatus;

/// Operator-driven transitions on an [`AlertStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Acknowledge,
    Start,
    Close,
}

impl StateMachine for AlertStatus {
    type Input = AlertAction;
    type Output = ();

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use AlertAction::*;
        use AlertStatus::*;

        match (self, input) {
            (Open, Acknowledge) => Ok((Acknowledged, ())),
            (Acknowledged, Start) => Ok((InProgress, ())),
            (Open, Close) | (Acknowledged, Close) | (InProgress, Close) => Ok((Closed, ())),
            (Closed, _) => Err(TransitionError::BusinessRuleViolation(
                "closed alerts do not reopen; open a new alert instead".to_string(),
            )),
            (from, input) => Err(TransitionError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{input:?}"),
            }),
        }
    }

    fn valid_inputs(&self) -> Vec<Self::Input> {
        match self {
            AlertStatus::Open => vec![AlertAction::Acknowledge, AlertAction::Close],
            AlertStatus::Acknowledged => vec![AlertAction::Start, AlertAction::Close],
            AlertStatus::InProgress => vec![AlertAction::Close],
            AlertStatus::Closed => vec![],
        }
    }
}
