use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::work::{Failure, Location};

/// Final verdict of one dispatch run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateOutcome {
    Success,
    SingleFailure(Failure),
    MultiFailure {
        count: usize,
        /// Every failure message, one per line, in submission order.
        message: String,
        /// First known location in submission order.
        location: Option<Location>,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Exactly one item failed; reads the same as the item's own failure.
    #[error(transparent)]
    Item(Failure),

    #[error("{count} work items failed:\n{message}")]
    Multiple {
        count: usize,
        message: String,
        location: Option<Location>,
    },
}

impl DispatchError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            DispatchError::Item(f) => f.location.as_ref(),
            DispatchError::Multiple { location, .. } => location.as_ref(),
        }
    }
}

impl AggregateOutcome {
    /// Reduce per-item results, given in submission order.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<(), Failure>>,
    {
        let mut failures: Vec<Failure> = results.into_iter().filter_map(Result::err).collect();

        match failures.len() {
            0 => AggregateOutcome::Success,
            1 => AggregateOutcome::SingleFailure(failures.remove(0)),
            count => {
                let mut location: Option<Location> = None;
                let mut lines = Vec::with_capacity(count);
                for f in failures {
                    if location.is_none() {
                        location = f.location;
                    }
                    lines.push(f.message);
                }
                AggregateOutcome::MultiFailure {
                    count,
                    message: lines.join("\n"),
                    location,
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AggregateOutcome::Success)
    }

    pub fn failure_count(&self) -> usize {
        match self {
            AggregateOutcome::Success => 0,
            AggregateOutcome::SingleFailure(_) => 1,
            AggregateOutcome::MultiFailure { count, .. } => *count,
        }
    }

    pub fn into_result(self) -> Result<(), DispatchError> {
        match self {
            AggregateOutcome::Success => Ok(()),
            AggregateOutcome::SingleFailure(f) => Err(DispatchError::Item(f)),
            AggregateOutcome::MultiFailure {
                count,
                message,
                location,
            } => Err(DispatchError::Multiple {
                count,
                message,
                location,
            }),
        }
    }
}
