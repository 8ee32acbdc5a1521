//! Title resolution against directory search results.

use std::collections::HashMap;

use async_trait::async_trait;
use podcharts_core::DirectoryCandidate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryClient, DirectoryError};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    ByTerm,
    ByTitle,
}

impl SearchStrategy {
    /// Title a candidate is compared by under this strategy.
    pub fn candidate_title<'a>(&self, candidate: &'a DirectoryCandidate) -> Option<&'a str> {
        match self {
            SearchStrategy::ByTerm => candidate.match_title(),
            SearchStrategy::ByTitle => candidate.title.as_deref().filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleMatch {
    pub candidate: DirectoryCandidate,
    pub ratio: f64,
    pub strategy: SearchStrategy,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Similarity in `[0, 1]` after trimming and lowercasing both sides.
pub fn similarity(a: &str, b: &str) -> f64 {
    sequence_ratio(&normalize(a), &normalize(b))
}

// Sequences at least this long get their most frequent elements ignored when
// searching for matches, as a gestalt matcher does.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Ratcliff/Obershelp ratio over chars: `2 * M / T`, where `M` counts chars in
/// the recursively found longest common blocks and `T` is the combined length.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * BlockMatcher::new(&a, &b).matched_len() as f64 / total as f64
}

struct BlockMatcher<'a> {
    a: &'a [char],
    b: &'a [char],
    b2j: HashMap<char, Vec<usize>>,
}

impl<'a> BlockMatcher<'a> {
    fn new(a: &'a [char], b: &'a [char]) -> Self {
        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, c) in b.iter().enumerate() {
            b2j.entry(*c).or_default().push(j);
        }
        if b.len() >= AUTOJUNK_MIN_LEN {
            let popular = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= popular);
        }
        Self { a, b, b2j }
    }

    /// Longest common block inside `a[alo..ahi]` and `b[blo..bhi]`, earliest on ties.
    fn longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (mut best_i, mut best_j, mut best_len) = (alo, blo, 0);
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let run = j
                        .checked_sub(1)
                        .and_then(|prev| j2len.get(&prev))
                        .copied()
                        .unwrap_or(0);
                    let k = run + 1;
                    next.insert(j, k);
                    if k > best_len {
                        best_i = i + 1 - k;
                        best_j = j + 1 - k;
                        best_len = k;
                    }
                }
            }
            j2len = next;
        }

        // Chars dropped as popular can still extend a block on either side.
        while best_i > alo && best_j > blo && self.a[best_i - 1] == self.b[best_j - 1] {
            best_i -= 1;
            best_j -= 1;
            best_len += 1;
        }
        while best_i + best_len < ahi
            && best_j + best_len < bhi
            && self.a[best_i + best_len] == self.b[best_j + best_len]
        {
            best_len += 1;
        }
        (best_i, best_j, best_len)
    }

    fn matched_len(&self) -> usize {
        let mut matched = 0;
        let mut pending = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            let (i, j, k) = self.longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            matched += k;
            if alo < i && blo < j {
                pending.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                pending.push((i + k, ahi, j + k, bhi));
            }
        }
        matched
    }
}

/// Highest-scoring candidate regardless of threshold. An exact normalized
/// match wins immediately with ratio 1.0; otherwise the first maximum wins.
pub fn best_match(
    query: &str,
    candidates: &[DirectoryCandidate],
    strategy: SearchStrategy,
) -> Option<TitleMatch> {
    let wanted = normalize(query);
    let mut best: Option<(usize, f64)> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(title) = strategy.candidate_title(candidate) else {
            continue;
        };
        let normalized = normalize(title);
        if normalized == wanted {
            return Some(TitleMatch {
                candidate: candidate.clone(),
                ratio: 1.0,
                strategy,
            });
        }
        let ratio = sequence_ratio(&wanted, &normalized);
        if best.map_or(true, |(_, top)| ratio > top) {
            best = Some((index, ratio));
        }
    }

    best.map(|(index, ratio)| TitleMatch {
        candidate: candidates[index].clone(),
        ratio,
        strategy,
    })
}

/// Best candidate when it clears `threshold`.
pub fn resolve(
    query: &str,
    candidates: &[DirectoryCandidate],
    strategy: SearchStrategy,
    threshold: f64,
) -> Option<TitleMatch> {
    best_match(query, candidates, strategy).filter(|m| m.ratio >= threshold)
}

/// Search seam so resolution can run against a fake directory.
#[async_trait]
pub trait DirectorySearch: Send + Sync {
    async fn search(
        &self,
        strategy: SearchStrategy,
        query: &str,
    ) -> Result<Vec<DirectoryCandidate>, DirectoryError>;
}

#[async_trait]
impl DirectorySearch for DirectoryClient {
    async fn search(
        &self,
        strategy: SearchStrategy,
        query: &str,
    ) -> Result<Vec<DirectoryCandidate>, DirectoryError> {
        match strategy {
            SearchStrategy::ByTerm => self.search_by_term(query).await,
            SearchStrategy::ByTitle => self.search_by_title(query).await,
        }
    }
}

/// Search by term, then by title when the first pass finds nothing above
/// `threshold`. A failed search counts as no candidates.
pub async fn resolve_title<S>(search: &S, query: &str, threshold: f64) -> Option<TitleMatch>
where
    S: DirectorySearch + ?Sized,
{
    for strategy in [SearchStrategy::ByTerm, SearchStrategy::ByTitle] {
        let candidates = match search.search(strategy, query).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(?strategy, query, error = %err, "directory search failed");
                Vec::new()
            }
        };
        match best_match(query, &candidates, strategy) {
            Some(found) if found.ratio >= threshold => {
                info!(
                    ?strategy,
                    query,
                    ratio = found.ratio,
                    candidate_id = ?found.candidate.id,
                    "title resolved"
                );
                return Some(found);
            }
            Some(found) => {
                debug!(?strategy, query, ratio = found.ratio, "best candidate below threshold");
            }
            None => debug!(?strategy, query, "no candidates"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn candidate(id: i64, title: &str) -> DirectoryCandidate {
        DirectoryCandidate {
            id: Some(id),
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        by_term: Vec<DirectoryCandidate>,
        by_title: Vec<DirectoryCandidate>,
        fail_term: bool,
        calls: Mutex<Vec<SearchStrategy>>,
    }

    #[async_trait]
    impl DirectorySearch for FakeDirectory {
        async fn search(
            &self,
            strategy: SearchStrategy,
            _query: &str,
        ) -> Result<Vec<DirectoryCandidate>, DirectoryError> {
            self.calls.lock().unwrap().push(strategy);
            match strategy {
                SearchStrategy::ByTerm if self.fail_term => Err(DirectoryError::MissingFeed),
                SearchStrategy::ByTerm => Ok(self.by_term.clone()),
                SearchStrategy::ByTitle => Ok(self.by_title.clone()),
            }
        }
    }

    #[test]
    fn exact_match_short_circuits_regardless_of_position() {
        let candidates = vec![
            candidate(1, "The Daily Show"),
            candidate(2, "The Dairy"),
            candidate(3, "  the daily "),
            candidate(4, "The Daily"),
        ];
        let found = resolve("The Daily", &candidates, SearchStrategy::ByTerm, 0.9).unwrap();
        assert_eq!(found.candidate.id, Some(3));
        assert_eq!(found.ratio, 1.0);
    }

    #[test]
    fn by_term_compares_original_title() {
        let mut hit = candidate(7, "daily-feed-slug");
        hit.title_original = Some("The Daily".into());
        let found = resolve("the daily", &[hit.clone()], SearchStrategy::ByTerm, 0.9).unwrap();
        assert_eq!(found.candidate.id, Some(7));
        assert!(resolve("the daily", &[hit], SearchStrategy::ByTitle, 0.9).is_none());
    }

    #[test]
    fn below_threshold_yields_none() {
        let candidates = vec![candidate(1, "Crime Junkie"), candidate(2, "Call Her Daddy")];
        assert!(resolve("The Daily", &candidates, SearchStrategy::ByTerm, 0.9).is_none());
        let best = best_match("The Daily", &candidates, SearchStrategy::ByTerm).unwrap();
        assert!(best.ratio < 0.9);
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let candidates = vec![candidate(1, "abcx"), candidate(2, "abcy")];
        let best = best_match("abcz", &candidates, SearchStrategy::ByTitle).unwrap();
        assert_eq!(best.candidate.id, Some(1));
    }

    #[test]
    fn untitled_candidates_are_skipped() {
        let candidates = vec![
            DirectoryCandidate {
                id: Some(1),
                ..Default::default()
            },
            candidate(2, "Huberman Lab"),
        ];
        let best = best_match("Huberman Lab", &candidates, SearchStrategy::ByTerm).unwrap();
        assert_eq!(best.candidate.id, Some(2));
        assert!(best_match("x", &[], SearchStrategy::ByTerm).is_none());
    }

    #[test]
    fn dropped_article_still_clears_threshold() {
        let ratio = similarity("The Joe Rogan Experience", "Joe Rogan Experience");
        assert!((ratio - 40.0 / 44.0).abs() < 1e-9);
        let ratio = similarity("The Mel Robbins Podcast", "Mel Robbins Podcast");
        assert!((ratio - 38.0 / 42.0).abs() < 1e-9);

        let found = resolve(
            "The Joe Rogan Experience",
            &[candidate(10, "Joe Rogan Experience")],
            SearchStrategy::ByTerm,
            DEFAULT_MATCH_THRESHOLD,
        )
        .unwrap();
        assert_eq!(found.candidate.id, Some(10));
        assert!(resolve(
            "The Mel Robbins Podcast",
            &[candidate(11, "Mel Robbins Podcast")],
            SearchStrategy::ByTitle,
            DEFAULT_MATCH_THRESHOLD,
        )
        .is_some());
    }

    #[test]
    fn sequence_ratio_counts_matching_blocks() {
        assert_eq!(sequence_ratio("", ""), 1.0);
        assert_eq!(sequence_ratio("abc", ""), 0.0);
        // One block "bcd": 2 * 3 / 8.
        assert!((sequence_ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
        assert!((sequence_ratio("abxcd", "abcd") - 8.0 / 9.0).abs() < 1e-9);
        assert!(similarity("The Daily", "The Daily Show") < DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn near_match_clears_threshold() {
        assert!(similarity("The Joe Rogan Experience", "the joe rogan experience!") >= 0.9);
    }

    #[tokio::test]
    async fn falls_back_to_title_search_below_threshold() {
        let fake = FakeDirectory {
            by_term: vec![candidate(1, "Something Else Entirely")],
            by_title: vec![candidate(2, "The Daily")],
            ..Default::default()
        };
        let found = resolve_title(&fake, "The Daily", 0.9).await.unwrap();
        assert_eq!(found.candidate.id, Some(2));
        assert_eq!(found.strategy, SearchStrategy::ByTitle);
        assert_eq!(
            *fake.calls.lock().unwrap(),
            vec![SearchStrategy::ByTerm, SearchStrategy::ByTitle]
        );
    }

    #[tokio::test]
    async fn term_hit_skips_title_search() {
        let fake = FakeDirectory {
            by_term: vec![candidate(1, "The Daily")],
            ..Default::default()
        };
        let found = resolve_title(&fake, "the daily", 0.9).await.unwrap();
        assert_eq!(found.strategy, SearchStrategy::ByTerm);
        assert_eq!(*fake.calls.lock().unwrap(), vec![SearchStrategy::ByTerm]);
    }

    #[tokio::test]
    async fn failed_search_is_treated_as_empty() {
        let fake = FakeDirectory {
            fail_term: true,
            by_title: vec![candidate(5, "Serial")],
            ..Default::default()
        };
        let found = resolve_title(&fake, "Serial", 0.9).await.unwrap();
        assert_eq!(found.candidate.id, Some(5));

        let nothing = FakeDirectory::default();
        assert!(resolve_title(&nothing, "Serial", 0.9).await.is_none());
    }
}
