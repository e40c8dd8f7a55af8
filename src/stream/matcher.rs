//! Case-insensitive option matching.

use crate::poll::Poll;

/// The options one session tracks, snapshotted at cycle start.
///
/// Options are kept in first-seen order with exact duplicates and blank
/// entries removed, so a post yields at most one vote per option.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: Vec<String>,
    lowered: Vec<String>,
}

impl OptionSet {
    pub fn new<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for option in options {
            let option = option.into();
            if option.trim().is_empty() || set.options.contains(&option) {
                continue;
            }
            set.lowered.push(option.to_lowercase());
            set.options.push(option);
        }
        set
    }

    /// Collect the options of every poll.
    pub fn from_polls(polls: &[Poll]) -> Self {
        Self::new(polls.iter().flat_map(|poll| poll.options.iter().cloned()))
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.options
    }

    /// Every option appearing in `text`, ignoring case.
    pub fn matches<'a>(&'a self, text: &str) -> impl Iterator<Item = &'a str> + 'a {
        let text = text.to_lowercase();
        self.options
            .iter()
            .zip(&self.lowered)
            .filter(move |(_, lowered)| text.contains(lowered.as_str()))
            .map(|(option, _)| option.as_str())
    }
}
