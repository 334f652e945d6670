use remedy_core::Priority;

/// Key layout of the queue store.
///
/// Tooling that inspects the store directly relies on these names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeySpace { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn priority(&self, priority: Priority) -> String {
        format!("{}:priority:{}", self.prefix, priority.value())
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }

    pub fn task(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    pub fn heartbeat(&self, task_id: &str) -> String {
        format!("{}:heartbeat:{}", self.prefix, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        let keys = KeySpace::new("ahop:queue");
        assert_eq!(keys.priority(Priority::HIGHEST), "ahop:queue:priority:1");
        assert_eq!(keys.priority(Priority::LOWEST), "ahop:queue:priority:10");
        assert_eq!(keys.processing(), "ahop:queue:processing");
        assert_eq!(keys.task("abc"), "ahop:queue:task:abc");
        assert_eq!(keys.heartbeat("abc"), "ahop:queue:heartbeat:abc");
    }
}
