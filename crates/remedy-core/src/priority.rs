use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Priority level for task dispatch.
/// Lower numerical values are served first: 1 is the most urgent, 10 the least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(10);

    /// Number of distinct priority levels
    pub const LEVELS: u8 = 10;

    /// Create a priority, rejecting values outside 1-10
    pub fn new(value: u8) -> Result<Self> {
        if (Self::HIGHEST.0..=Self::LOWEST.0).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(CoreError::InvalidPriority(value))
        }
    }

    /// Build a priority from stored data without validation.
    ///
    /// The queue store does not validate priorities on enqueue, so values read back
    /// are taken as given.
    pub fn from_raw(value: u8) -> Self {
        Priority(value)
    }

    /// Get the raw priority value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// All levels in dequeue order, most urgent first
    pub fn levels() -> impl Iterator<Item = Priority> {
        (Self::HIGHEST.0..=Self::LOWEST.0).map(Priority)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    // more urgent compares greater
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_range() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(11).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::new(10).unwrap(), Priority::LOWEST);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGHEST > Priority::LOWEST);
        assert!(Priority::new(2).unwrap() > Priority::new(3).unwrap());
    }

    #[test]
    fn test_levels_in_dequeue_order() {
        let levels: Vec<u8> = Priority::levels().map(|p| p.value()).collect();
        assert_eq!(levels, (1..=10).collect::<Vec<u8>>());
    }
}
