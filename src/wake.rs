//! Phrase matching over recognizer transcripts
//!
//! Matching is case-insensitive containment on whitespace-normalized text, so
//! a phrase is found in both interim and final fragments as soon as the
//! recognizer has produced it.

/// A set of phrases matched by containment
#[derive(Debug, Clone)]
pub struct PhraseSet {
    phrases: Vec<String>,
}

impl PhraseSet {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    /// The first configured phrase contained in `text`
    pub fn find(&self, text: &str) -> Option<&str> {
        let text = normalize(text);
        self.phrases
            .iter()
            .find(|phrase| text.contains(phrase.as_str()))
            .map(String::as_str)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

/// Detects the activation phrase while the controller listens passively
#[derive(Debug, Clone)]
pub struct WakePhraseDetector {
    phrases: PhraseSet,
}

impl WakePhraseDetector {
    pub fn new(phrases: PhraseSet) -> Self {
        Self { phrases }
    }

    /// Whether the transcript (interim or final) contains a wake phrase
    pub fn detect(&self, transcript: &str) -> bool {
        self.phrases.matches(transcript)
    }
}

/// Lower-case, strip punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
