//! Runtime configuration.
//!
//! All fields have defaults, so a config file only needs to mention the
//! settings it changes:
//!
//! ```rust,ignore
//! let config = RuntimeConfig::from_json(r#"{ "name": "editor", "max_commit_rounds": 16 }"#)?;
//! let rt = Runtime::with_config(config);
//! ```

use serde::{Deserialize, Serialize};

/// Tunables for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Label used in log fields and graph snapshots.
    pub name: Option<String>,

    /// Upper bound on follow-up rounds in a single commit. A reaction that
    /// writes a value read by another reaction causes one more round; a
    /// reaction feeding itself would otherwise loop forever.
    pub max_commit_rounds: usize,

    /// How many structural changes a container remembers for its change
    /// trackers. A tracker that falls further behind gets a reset.
    pub change_log_capacity: usize,

    /// Catch panics raised by reaction bodies and report them like errors.
    /// With this disabled a panicking reaction unwinds through the commit.
    pub catch_reaction_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_commit_rounds: 100,
            change_log_capacity: 1024,
            catch_reaction_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the runtime label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the commit round limit. Zero is bumped to one.
    pub fn with_max_commit_rounds(mut self, rounds: usize) -> Self {
        self.max_commit_rounds = rounds.max(1);
        self
    }

    /// Set the per-container change log capacity.
    pub fn with_change_log_capacity(mut self, capacity: usize) -> Self {
        self.change_log_capacity = capacity;
        self
    }

    /// Toggle catching of reaction panics.
    pub fn with_catch_reaction_panics(mut self, catch: bool) -> Self {
        self.catch_reaction_panics = catch;
        self
    }
}
