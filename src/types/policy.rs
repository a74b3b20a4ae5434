//! Backend selection policies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OrchesityError;

/// How the weight scorer orders eligible backends.
///
/// A closed set. Each variant maps to one ranking function in
/// [`scoring::scorer`](crate::scoring::scorer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Weighted composite of normalized accuracy, speed, cost and availability.
    #[default]
    LoadBalanced,
    /// Rotating cursor over backends in identity order; ignores metrics.
    RoundRobin,
    /// Uniform shuffle; reseedable for deterministic tests.
    Random,
    /// Static configured order with a consecutive-failure health gate.
    Priority,
}

impl SelectionPolicy {
    pub const ALL: [SelectionPolicy; 4] = [
        SelectionPolicy::LoadBalanced,
        SelectionPolicy::RoundRobin,
        SelectionPolicy::Random,
        SelectionPolicy::Priority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::LoadBalanced => "load_balanced",
            SelectionPolicy::RoundRobin => "round_robin",
            SelectionPolicy::Random => "random",
            SelectionPolicy::Priority => "priority",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = OrchesityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SelectionPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| OrchesityError::Configuration(format!("unknown selection policy: {s}")))
    }
}
