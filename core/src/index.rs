use serde::{Deserialize, Serialize};

/// Occurrence count of a keyword within one document.
pub type Frequency = u32;

/// One row of the postings relation. At most one exists per `(keyword, url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub keyword: String,
    pub url: String,
    pub frequency: Frequency,
}

/// A document matched by a query and its summed term frequency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedResult {
    pub url: String,
    pub score: u64,
}

impl RankedResult {
    pub fn new(url: impl Into<String>, score: u64) -> Self {
        Self { url: url.into(), score }
    }
}
