//! Configurable substring filter applied to the sender address before a
//! message is forwarded anywhere downstream.

#[derive(Debug, Clone, Default)]
pub struct SpamFilter {
    sender_substrings: Vec<String>,
}

impl SpamFilter {
    pub fn new(sender_substrings: Vec<String>) -> Self {
        let sender_substrings = sender_substrings.into_iter().map(|s| s.to_lowercase()).collect();
        Self { sender_substrings }
    }

    pub fn is_spam(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();
        self.sender_substrings.iter().any(|needle| sender.contains(needle.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitive_substring() {
        let filter = SpamFilter::new(vec!["spammer.biz".to_string()]);
        assert!(filter.is_spam("Deals@SPAMMER.biz"));
        assert!(!filter.is_spam("person@example.com"));
    }

    #[test]
    fn empty_list_blocks_nothing() {
        let filter = SpamFilter::default();
        assert!(!filter.is_spam("anyone@anywhere.com"));
    }
}
