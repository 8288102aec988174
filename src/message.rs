/// A single header as received from the MTA. Order of arrival is preserved
/// by the containing [`MessageContext`]; a name may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderEntry {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Header names compare case-insensitively.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Where a message currently sits in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagePhase {
    /// Headers still arriving.
    #[default]
    Collecting,
    /// End of headers seen, rewrite decision recorded.
    Decided,
}

/// Per-message scratch state, owned by exactly one session and dropped at
/// end-of-message or abort.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub headers: Vec<HeaderEntry>,
    pub phase: MessagePhase,
    /// Outcome of the rewrite-requirement evaluation, recorded at the
    /// end-of-headers transition. `None` until then.
    pub rewrite_decision: Option<bool>,
    /// Queue id reported by the MTA, for log context only.
    pub queue_id: Option<String>,
}

impl MessageContext {
    pub fn new() -> Self {
        MessageContext::default()
    }

    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(HeaderEntry::new(name, value));
    }

    /// First instance of a header, by case-insensitive name.
    pub fn first(&self, name: &str) -> Option<&HeaderEntry> {
        self.headers.iter().find(|h| h.is_named(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_is_case_insensitive() {
        let mut ctx = MessageContext::new();
        ctx.push_header("From", "alice@example.org");
        ctx.push_header("Subject", "hi");
        assert_eq!(ctx.first("from").unwrap().value, "alice@example.org");
        assert_eq!(ctx.first("FROM").unwrap().value, "alice@example.org");
        assert!(ctx.first("Reply-To").is_none());
    }

    #[test]
    fn test_first_returns_first_of_repeated_headers() {
        let mut ctx = MessageContext::new();
        ctx.push_header("Received", "one");
        ctx.push_header("Received", "two");
        assert_eq!(ctx.first("received").unwrap().value, "one");
        assert_eq!(ctx.headers.len(), 2);
    }

    #[test]
    fn test_new_context_is_undecided() {
        let ctx = MessageContext::new();
        assert_eq!(ctx.phase, MessagePhase::Collecting);
        assert!(ctx.rewrite_decision.is_none());
        assert!(ctx.headers.is_empty());
    }
}
