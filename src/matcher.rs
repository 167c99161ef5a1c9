use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::db::Db;
use crate::embedding::{EmbeddingProvider, normalize_text};
use crate::error::ChatError;
use crate::models::{CandidateScore, MatchResult, Scores, SongCandidate, SongRef};

pub const DEFAULT_EF_SEARCH: u32 = 100;
pub const MAX_TEXT_CODEPOINTS: usize = 500;

/// N: primary plus up to N-1 alternates.
const RESULT_COUNT: usize = 5;
/// Over-fetch factor: KNN fetches 2N so re-ranking has room to work.
const OVERFETCH: usize = 2;
/// Below this similarity the whole result is flagged `veryWeak`.
const WEAK_FLOOR: f32 = 0.15;
/// Popularity can boost a candidate by at most this share of its similarity.
const POPULARITY_BOOST_CAP: f32 = 0.10;
/// Diversity cap: at most this many songs per canonical primary artist in
/// the top N, so one artist cannot dominate a result.
const MAX_PER_ARTIST: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub ef_search: u32,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

/// Orchestrates query embedding → KNN → re-rank → fingerprinted result.
/// Degrades to a popularity-only fallback rather than failing; only
/// invalid input is an error.
pub struct SongMatcher {
    db: Db,
    embedder: Arc<EmbeddingProvider>,
    index_version: String,
    debug: bool,
}

/// Deterministic hash of (normalized text, model version, index version).
/// Two distinct normalized texts must produce distinct fingerprints —
/// the regression guard for "every message matches the same song".
pub fn fingerprint(normalized: &str, model_version: &str, index_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model_version.as_bytes());
    hasher.update([0x1f]);
    hasher.update(index_version.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn boosted_score(c: &SongCandidate) -> f32 {
    c.similarity * (1.0 + POPULARITY_BOOST_CAP * (c.popularity.clamp(0, 100) as f32 / 100.0))
}

/// Order by popularity-boosted similarity, then enforce the per-artist
/// diversity cap while collecting the top `n`.
fn re_rank(mut candidates: Vec<SongCandidate>, n: usize) -> Vec<SongCandidate> {
    candidates.sort_by(|a, b| {
        boosted_score(b)
            .partial_cmp(&boosted_score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.song.id.cmp(&b.song.id))
    });

    let mut per_artist: HashMap<String, usize> = HashMap::new();
    let mut picked = Vec::with_capacity(n);
    for candidate in candidates {
        let key = candidate.artist_primary.to_lowercase();
        let seen = per_artist.entry(key).or_insert(0);
        if *seen >= MAX_PER_ARTIST {
            continue;
        }
        *seen += 1;
        picked.push(candidate);
        if picked.len() == n {
            break;
        }
    }
    picked
}

fn build_result(
    ranked: Vec<SongCandidate>,
    mode: &str,
    reasoning: String,
    model_version: &str,
    ef_search: u32,
    fp: String,
    very_weak: bool,
) -> MatchResult {
    let candidates = ranked
        .iter()
        .map(|c| CandidateScore {
            song_id: c.song.id.clone(),
            similarity: c.similarity,
        })
        .collect();
    let mut songs = ranked.into_iter().map(|c| c.song);
    let primary = songs.next();
    let alternates: Vec<SongRef> = songs.collect();

    MatchResult {
        primary,
        alternates,
        scores: Scores {
            mode: mode.to_string(),
            model: model_version.to_string(),
            ef_search,
            candidates,
            fingerprint: fp.clone(),
            very_weak,
        },
        reasoning,
        fingerprint: fp,
    }
}

impl SongMatcher {
    pub fn new(
        db: Db,
        embedder: Arc<EmbeddingProvider>,
        index_version: String,
        debug: bool,
    ) -> Self {
        Self {
            db,
            embedder,
            index_version,
            debug,
        }
    }

    /// Match free text against the catalog. Every accepted input gets a
    /// fingerprint, including fallback results.
    pub async fn match_text(
        &self,
        text: &str,
        opts: MatchOptions,
    ) -> Result<MatchResult, ChatError> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(ChatError::Validation("text must not be empty".to_string()));
        }
        if normalized.chars().count() > MAX_TEXT_CODEPOINTS {
            return Err(ChatError::Validation(format!(
                "text must be at most {MAX_TEXT_CODEPOINTS} characters"
            )));
        }

        let fp = fingerprint(
            &normalized,
            self.embedder.model_version(),
            &self.index_version,
        );

        let result = match self.embedder.embed(&normalized).await {
            Ok(query) => match self.db.search_knn(&query, RESULT_COUNT * OVERFETCH, opts.ef_search).await {
                Ok(candidates) if !candidates.is_empty() => {
                    let ranked = re_rank(candidates, RESULT_COUNT);
                    let top = ranked.first().map(|c| c.similarity).unwrap_or(0.0);
                    let very_weak = top < WEAK_FLOOR;
                    let reasoning = if very_weak {
                        format!("semantic match (weak): top similarity {top:.3}")
                    } else {
                        format!(
                            "semantic match: top similarity {top:.3} across {} candidates",
                            ranked.len()
                        )
                    };
                    build_result(
                        ranked,
                        "semantic",
                        reasoning,
                        self.embedder.model_version(),
                        opts.ef_search,
                        fp.clone(),
                        very_weak,
                    )
                }
                Ok(_) => {
                    self.popularity_fallback("fallback: no index candidates", opts.ef_search, &fp)
                        .await
                }
                Err(e) => {
                    eprintln!("⚠️  KNN query failed: {e}");
                    self.popularity_fallback("fallback: index unavailable", opts.ef_search, &fp)
                        .await
                }
            },
            Err(e) => {
                eprintln!("⚠️  Embedding failed: {e}");
                self.popularity_fallback("fallback: embedder unavailable", opts.ef_search, &fp)
                    .await
            }
        };

        if self.debug {
            println!(
                "🎯 match fp={} mode={} primary={}",
                result.fingerprint,
                result.scores.mode,
                result
                    .primary
                    .as_ref()
                    .map(|s| s.id.as_str())
                    .unwrap_or("-")
            );
        }
        Ok(result)
    }

    /// Top songs by popularity with zero similarity. The distinct
    /// `reasoning` string records which failure led here.
    async fn popularity_fallback(
        &self,
        reasoning: &str,
        ef_search: u32,
        fp: &str,
    ) -> MatchResult {
        let ranked = match self.db.top_by_popularity(RESULT_COUNT).await {
            Ok(songs) => songs,
            Err(e) => {
                eprintln!("⚠️  Popularity fallback failed: {e}");
                vec![]
            }
        };
        let reasoning = if ranked.is_empty() {
            "fallback: catalog unavailable".to_string()
        } else {
            reasoning.to_string()
        };
        build_result(
            ranked,
            "fallback",
            reasoning,
            self.embedder.model_version(),
            ef_search,
            fp.to_string(),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, artist: &str, popularity: i32, similarity: f32) -> SongCandidate {
        SongCandidate {
            song: SongRef {
                id: id.to_string(),
                title: format!("title-{id}"),
                artist: artist.to_string(),
                year: None,
            },
            artist_primary: artist.to_string(),
            popularity,
            similarity,
        }
    }

    #[test]
    fn fingerprints_differ_for_distinct_texts() {
        let a = fingerprint("feeling sad and lonely tonight", "m1", "idx1");
        let b = fingerprint("lets dance all night long baby", "m1", "idx1");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_deterministic_and_version_sensitive() {
        let a = fingerprint("hello", "m1", "idx1");
        assert_eq!(a, fingerprint("hello", "m1", "idx1"));
        assert_ne!(a, fingerprint("hello", "m2", "idx1"));
        assert_ne!(a, fingerprint("hello", "m1", "idx2"));
    }

    #[test]
    fn popularity_boost_breaks_near_ties_only() {
        // b is slightly less similar but maximally popular: boost wins.
        let ranked = re_rank(
            vec![
                candidate("a", "artist-a", 0, 0.700),
                candidate("b", "artist-b", 100, 0.660),
            ],
            5,
        );
        assert_eq!(ranked[0].song.id, "b");

        // A 10% boost can never overturn a clearly better match.
        let ranked = re_rank(
            vec![
                candidate("a", "artist-a", 0, 0.700),
                candidate("b", "artist-b", 100, 0.600),
            ],
            5,
        );
        assert_eq!(ranked[0].song.id, "a");
    }

    #[test]
    fn diversity_caps_two_per_artist() {
        let ranked = re_rank(
            vec![
                candidate("a1", "Same Artist", 50, 0.9),
                candidate("a2", "same artist", 50, 0.8),
                candidate("a3", "SAME ARTIST", 50, 0.7),
                candidate("b1", "Other", 50, 0.6),
            ],
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.song.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn re_rank_orders_by_similarity_desc() {
        let ranked = re_rank(
            vec![
                candidate("low", "x", 0, 0.2),
                candidate("high", "y", 0, 0.9),
                candidate("mid", "z", 0, 0.5),
            ],
            5,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.song.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn build_result_splits_primary_and_alternates() {
        let result = build_result(
            vec![
                candidate("a", "x", 10, 0.8),
                candidate("b", "y", 20, 0.7),
                candidate("c", "z", 30, 0.6),
            ],
            "semantic",
            "r".into(),
            "model",
            100,
            "fp".into(),
            false,
        );
        assert!((result.similarity() - 0.8).abs() < 1e-6);
        assert_eq!(result.primary.unwrap().id, "a");
        assert_eq!(result.alternates.len(), 2);
        assert_eq!(result.scores.candidates.len(), 3);
    }

    #[test]
    fn empty_fallback_has_fingerprint_and_no_primary() {
        let result = build_result(
            vec![],
            "fallback",
            "fallback: catalog unavailable".into(),
            "model",
            100,
            "fp".into(),
            false,
        );
        assert!(result.primary.is_none());
        assert!(!result.fingerprint.is_empty());
        assert_eq!(result.similarity(), 0.0);
    }
}
