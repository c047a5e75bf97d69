//! Sender allow-list for inbound messages

use std::collections::HashSet;

/// Phone numbers whose inbound messages are forwarded to the webhook.
/// Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct SenderFilter {
    allowed: HashSet<String>,
}

impl SenderFilter {
    /// Parse a comma-separated list; entries are trimmed and blanks dropped
    pub fn parse(raw: &str) -> Self {
        let allowed = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { allowed }
    }

    /// Exact membership test on the sender's user part
    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.allowed.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
