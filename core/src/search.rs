use crate::error::Result;
use crate::index::RankedResult;
use crate::store::IndexReader;
use crate::tokenizer::tokenize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Distinct normalized query terms in first-occurrence order.
    pub terms: Vec<String>,
    pub results: Vec<RankedResult>,
    pub elapsed: Duration,
}

/// Query side of the index. Holds only a read handle, so cloning it across
/// request handlers shares one published generation.
#[derive(Clone, Default)]
pub struct SearchEngine {
    reader: IndexReader,
}

impl SearchEngine {
    pub fn new(reader: IndexReader) -> Self {
        Self { reader }
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self::new(IndexReader::open(root)?))
    }

    pub fn generation(&self) -> Option<u64> {
        self.reader.generation()
    }

    /// OR-match every distinct query term and rank documents by summed
    /// frequency, highest first, ties broken by ascending url.
    pub fn search(&self, raw_query: &str) -> Result<SearchOutcome> {
        let start = Instant::now();
        let terms = query_terms(raw_query);
        let mut scores: HashMap<String, u64> = HashMap::new();
        for term in &terms {
            for posting in self.reader.postings(term)? {
                *scores.entry(posting.url).or_insert(0) += u64::from(posting.frequency);
            }
        }
        let results = rank(scores);
        let elapsed = start.elapsed();
        debug!(query = raw_query, terms = terms.len(), hits = results.len(), ?elapsed, "search");
        Ok(SearchOutcome { terms, results, elapsed })
    }
}

fn query_terms(raw_query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(raw_query).filter(|t| seen.insert(t.clone())).collect()
}

fn rank(scores: HashMap<String, u64>) -> Vec<RankedResult> {
    let mut results: Vec<RankedResult> = scores
        .into_iter()
        .map(|(url, score)| RankedResult { url, score })
        .collect();
    results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.url.cmp(&b.url)));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexWriter;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn engine_with(docs: &[(&str, &[(&str, u32)])]) -> (tempfile::TempDir, SearchEngine) {
        let dir = tempdir().unwrap();
        let mut writer = IndexWriter::create(dir.path()).unwrap();
        for (url, counts) in docs {
            let counts: BTreeMap<String, u32> = counts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            writer.put_document(url, &counts).unwrap();
        }
        writer.commit().unwrap();
        let engine = SearchEngine::open(dir.path()).unwrap();
        (dir, engine)
    }

    #[test]
    fn query_terms_are_normalized_and_deduplicated() {
        assert_eq!(query_terms("Cat cat <b>DOG</b> cat"), vec!["cat", "dog"]);
        assert!(query_terms("  123 !!").is_empty());
    }

    #[test]
    fn rank_orders_by_score_then_url() {
        let scores: HashMap<String, u64> =
            [("b", 3), ("c", 7), ("a", 3)].into_iter().map(|(u, s)| (u.to_string(), s)).collect();
        let ranked = rank(scores);
        assert_eq!(
            ranked,
            vec![RankedResult::new("c", 7), RankedResult::new("a", 3), RankedResult::new("b", 3)]
        );
    }

    #[test]
    fn sums_frequencies_across_terms() {
        let (_dir, engine) = engine_with(&[("A", &[("x", 5)]), ("B", &[("x", 2), ("y", 4)])]);
        let outcome = engine.search("x y").unwrap();
        assert_eq!(outcome.results, vec![RankedResult::new("B", 6), RankedResult::new("A", 5)]);
    }

    #[test]
    fn duplicate_terms_count_once() {
        let (_dir, engine) = engine_with(&[("A", &[("cat", 2)])]);
        let once = engine.search("cat").unwrap();
        let twice = engine.search("cat CAT cat").unwrap();
        assert_eq!(once.results, twice.results);
        assert_eq!(twice.results, vec![RankedResult::new("A", 2)]);
    }

    #[test]
    fn empty_and_unmatched_queries_return_nothing() {
        let (_dir, engine) = engine_with(&[("A", &[("cat", 2)])]);
        assert!(engine.search("").unwrap().results.is_empty());
        assert!(engine.search("nonexistentterm").unwrap().results.is_empty());
    }

    #[test]
    fn empty_engine_returns_nothing() {
        let engine = SearchEngine::default();
        assert_eq!(engine.generation(), None);
        assert!(engine.search("anything").unwrap().results.is_empty());
    }
}
