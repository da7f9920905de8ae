//! Task priority value object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Priority assigned to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Can wait.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Needs attention soon.
    High,
}

impl TaskPriority {
    /// Returns the canonical wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Numeric rank used for sorting (higher is more urgent).
    #[must_use]
    pub const fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    /// All possible priorities.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Low, Self::Medium, Self::High]
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown task priority '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_ordering() {
        assert!(TaskPriority::High.rank() > TaskPriority::Medium.rank());
        assert!(TaskPriority::Medium.rank() > TaskPriority::Low.rank());
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }
}
