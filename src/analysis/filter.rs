//! Key filter
//!
//! A threadsafe container for the regex restricting which keys are
//! tracked. The empty pattern matches everything.

use parking_lot::RwLock;
use regex::Regex;

use crate::protocol::Event;

#[derive(Debug, Default)]
pub struct KeyFilter {
    re: RwLock<Option<Regex>>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new pattern for future events. An empty pattern removes
    /// the filter.
    pub fn set_pattern(&self, pattern: &str) -> Result<(), regex::Error> {
        let re = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern)?)
        };
        *self.re.write() = re;
        Ok(())
    }

    /// Retain only the events whose key matches the active pattern.
    pub fn filter_events(&self, mut evts: Vec<Event>) -> Vec<Event> {
        let guard = self.re.read();
        let Some(re) = guard.as_ref() else {
            return evts;
        };
        evts.retain(|e| re.is_match(&e.key));
        evts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    fn events(keys: &[&str]) -> Vec<Event> {
        keys.iter()
            .map(|k| Event {
                kind: EventKind::GetHit,
                key: k.to_string(),
                size: 1,
            })
            .collect()
    }

    #[test]
    fn test_empty_pattern_matches_all() {
        let f = KeyFilter::new();
        assert_eq!(f.filter_events(events(&["a", "b"])).len(), 2);
    }

    #[test]
    fn test_pattern_filters_keys() {
        let f = KeyFilter::new();
        f.set_pattern("^user:").unwrap();
        let out = f.filter_events(events(&["user:1", "sess:2", "user:3"]));
        let keys: Vec<&str> = out.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["user:1", "user:3"]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let f = KeyFilter::new();
        f.set_pattern("valid.*").unwrap();
        assert!(f.set_pattern("(unclosed").is_err());
        // the previous pattern stays active
        assert_eq!(f.filter_events(events(&["valid1", "nope"])).len(), 1);
    }

    #[test]
    fn test_clearing_pattern() {
        let f = KeyFilter::new();
        f.set_pattern("^x").unwrap();
        f.set_pattern("").unwrap();
        assert_eq!(f.filter_events(events(&["a", "b"])).len(), 2);
    }
}
