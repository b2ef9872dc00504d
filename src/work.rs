use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque source-location token attached to a failure (e.g. `plan.yaml#items[2]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Location(String);

impl Location {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a work item did not complete normally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    #[serde(default)]
    pub location: Option<Location>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location: Some(location),
        }
    }

    /// Location token, or `"unknown"` when none was attached.
    pub fn location_display(&self) -> &str {
        self.location
            .as_ref()
            .map(Location::as_str)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{loc}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Failure {}

/// A unit of work the dispatcher can start on its own thread.
///
/// The dispatcher never looks inside `run`; it only records whether it
/// returned `Ok` or a [`Failure`].
pub trait WorkItem: Send + 'static {
    fn run(self: Box<Self>) -> Result<(), Failure>;

    /// Short human label used in logs and thread names.
    fn label(&self) -> Option<&str> {
        None
    }

    /// Where the item was declared; attached to launch failures.
    fn location(&self) -> Option<Location> {
        None
    }
}

impl<F> WorkItem for F
where
    F: FnOnce() -> Result<(), Failure> + Send + 'static,
{
    fn run(self: Box<Self>) -> Result<(), Failure> {
        (*self)()
    }
}

/// Render a caught panic payload the way the panic hook would.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
