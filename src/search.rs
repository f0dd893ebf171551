//! Hybrid retrieval over one or more knowledge bases.
//!
//! # Algorithm
//!
//! 1. Fetch up to `candidate_k_keyword` FTS5 hits and up to
//!    `candidate_k_vector` cosine hits (depending on mode).
//! 2. Min-max normalize each channel to `[0, 1]`; a channel whose scores are
//!    all equal normalizes to `1.0`.
//! 3. `score = (1 - α)·keyword + α·vector`, where α is `hybrid_alpha` for
//!    hybrid mode, `0` for keyword and `1` for semantic.
//! 4. For document results, group chunks by document with MAX.
//! 5. Sort by score desc, `updated_at` desc, id asc and truncate.
//!
//! Free-text queries are turned into an FTS5 OR-query of quoted terms by
//! [`fts_query`], so user punctuation never produces a MATCH syntax error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::RetrievalConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::index::{self, ChunkCandidate};
use crate::models::ts;

/// Most terms kept from a free-text query.
const MAX_QUERY_TERMS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    /// Hybrid when embeddings are available, keyword otherwise.
    pub fn default_for(provider: &dyn EmbeddingProvider) -> Self {
        if provider.is_enabled() {
            SearchMode::Hybrid
        } else {
            SearchMode::Keyword
        }
    }

    fn alpha(self, hybrid_alpha: f64) -> f64 {
        match self {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }

    fn uses_keyword(self) -> bool {
        matches!(self, SearchMode::Keyword | SearchMode::Hybrid)
    }

    fn uses_vector(self) -> bool {
        matches!(self, SearchMode::Semantic | SearchMode::Hybrid)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for SearchMode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(KbError::bad_request(format!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ))),
        }
    }
}

/// A document-level search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub knowledge_base_id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub score: f64,
    pub snippet: String,
    pub updated_at: DateTime<Utc>,
}

/// A chunk-level hit with its full text, used to build chat context.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub score: f64,
    pub snippet: String,
    pub text: String,
}

#[derive(Debug, Clone)]
struct ScoredChunk {
    chunk_id: String,
    document_id: String,
    score: f64,
    snippet: String,
}

/// Quote each alphanumeric term and join with OR. Empty when the query has
/// no searchable terms.
pub fn fts_query(query: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_QUERY_TERMS)
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Min-max normalize scores to `[0, 1]`.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Combine both channels into one score per chunk, best first.
fn fuse_scores(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<ScoredChunk> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut all: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut scored: Vec<ScoredChunk> = all
        .into_iter()
        .map(|(chunk_id, cand)| {
            let k = kw_map.get(chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(chunk_id).copied().unwrap_or(0.0);
            ScoredChunk {
                chunk_id: chunk_id.to_string(),
                document_id: cand.document_id.clone(),
                score: (1.0 - alpha) * k + alpha * v,
                snippet: cand.snippet.clone(),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    scored
}

/// MAX aggregation: each document keeps its best chunk's score and snippet.
/// Input must be sorted best first.
fn best_per_document(scored: &[ScoredChunk]) -> Vec<&ScoredChunk> {
    let mut seen = std::collections::HashSet::new();
    scored
        .iter()
        .filter(|sc| seen.insert(sc.document_id.as_str()))
        .collect()
}

async fn retrieve(
    pool: &SqlitePool,
    cfg: &RetrievalConfig,
    provider: &dyn EmbeddingProvider,
    knowledge_base_ids: &[String],
    query: &str,
    mode: SearchMode,
) -> KbResult<Vec<ScoredChunk>> {
    if mode.uses_vector() && !provider.is_enabled() {
        return Err(KbError::Disabled(format!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode
        )));
    }
    if query.trim().is_empty() || knowledge_base_ids.is_empty() {
        return Ok(Vec::new());
    }

    let keyword = if mode.uses_keyword() {
        index::keyword_candidates(
            pool,
            &fts_query(query),
            knowledge_base_ids,
            cfg.candidate_k_keyword,
        )
        .await?
    } else {
        Vec::new()
    };

    let vector = if mode.uses_vector() {
        let query_vec = embedding::embed_query(provider, query)
            .await
            .map_err(|e| KbError::Upstream(e.to_string()))?;
        index::vector_candidates(
            pool,
            &query_vec,
            provider.model_name(),
            knowledge_base_ids,
            cfg.candidate_k_vector,
        )
        .await?
    } else {
        Vec::new()
    };

    Ok(fuse_scores(&keyword, &vector, mode.alpha(cfg.hybrid_alpha)))
}

/// Ranked documents matching `query` within the given knowledge bases.
pub async fn search_documents(
    pool: &SqlitePool,
    cfg: &RetrievalConfig,
    provider: &dyn EmbeddingProvider,
    knowledge_base_ids: &[String],
    query: &str,
    mode: SearchMode,
    limit: Option<i64>,
) -> KbResult<Vec<SearchResult>> {
    let scored = retrieve(pool, cfg, provider, knowledge_base_ids, query, mode).await?;
    let best = best_per_document(&scored);
    let ids: Vec<String> = best.iter().map(|sc| sc.document_id.clone()).collect();
    let meta = index::document_meta(pool, &ids).await?;

    let mut results: Vec<SearchResult> = best
        .into_iter()
        .filter_map(|sc| {
            let doc = meta.get(&sc.document_id)?;
            Some(SearchResult {
                document_id: doc.id.clone(),
                knowledge_base_id: doc.knowledge_base_id.clone(),
                source_id: doc.source_id.clone(),
                title: doc.title.clone(),
                url: doc.url.clone(),
                score: sc.score,
                snippet: sc.snippet.clone(),
                updated_at: ts(doc.updated_at),
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.document_id.cmp(&b.document_id))
    });
    results.truncate(limit.unwrap_or(cfg.final_limit).max(0) as usize);
    Ok(results)
}

/// Best individual chunks for `query`, with full text.
pub async fn search_chunks(
    pool: &SqlitePool,
    cfg: &RetrievalConfig,
    provider: &dyn EmbeddingProvider,
    knowledge_base_ids: &[String],
    query: &str,
    mode: SearchMode,
    limit: i64,
) -> KbResult<Vec<ChunkHit>> {
    let mut scored = retrieve(pool, cfg, provider, knowledge_base_ids, query, mode).await?;
    scored.truncate(limit.max(0) as usize);

    let chunk_ids: Vec<String> = scored.iter().map(|sc| sc.chunk_id.clone()).collect();
    let doc_ids: Vec<String> = scored.iter().map(|sc| sc.document_id.clone()).collect();
    let texts = index::chunk_texts(pool, &chunk_ids).await?;
    let meta = index::document_meta(pool, &doc_ids).await?;

    Ok(scored
        .into_iter()
        .filter_map(|sc| {
            let text = texts.get(&sc.chunk_id)?.clone();
            let doc = meta.get(&sc.document_id);
            Some(ChunkHit {
                title: doc.and_then(|d| d.title.clone()),
                url: doc.and_then(|d| d.url.clone()),
                chunk_id: sc.chunk_id,
                document_id: sc.document_id,
                score: sc.score,
                snippet: sc.snippet,
                text,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, doc_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    fn order(scored: &[ScoredChunk]) -> Vec<&str> {
        scored.iter().map(|s| s.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![
            make_candidate("c1", "d1", 3.0),
            make_candidate("c2", "d2", 3.0),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_hybrid_alpha_zero_equals_keyword() {
        let kw = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
            make_candidate("c3", "d3", 1.0),
        ];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c2", "d2", 0.9),
        ];
        let fused = fuse_scores(&kw, &vec_cands, 0.0);
        assert_eq!(order(&fused), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_hybrid_alpha_one_equals_vector() {
        let kw = vec![
            make_candidate("c1", "d1", 10.0),
            make_candidate("c2", "d2", 5.0),
        ];
        let vec_cands = vec![
            make_candidate("c1", "d1", 0.1),
            make_candidate("c2", "d2", 0.9),
            make_candidate("c3", "d3", 0.5),
        ];
        let fused = fuse_scores(&kw, &vec_cands, 1.0);
        assert_eq!(&order(&fused)[..3], &["c2", "c3", "c1"]);
    }

    #[test]
    fn test_fused_scores_stay_in_unit_interval() {
        let kw = vec![make_candidate("a", "d", -5.0), make_candidate("b", "d", 100.0)];
        let vec_cands = vec![make_candidate("b", "d", 0.3), make_candidate("c", "e", 0.9)];
        for sc in fuse_scores(&kw, &vec_cands, 0.6) {
            assert!((0.0..=1.0).contains(&sc.score), "out of range: {}", sc.score);
        }
    }

    #[test]
    fn test_documents_keep_their_best_chunk() {
        let kw = vec![
            make_candidate("c1", "d1", 1.0),
            make_candidate("c2", "d1", 9.0),
            make_candidate("c3", "d2", 5.0),
        ];
        let fused = fuse_scores(&kw, &[], 0.0);
        let best = best_per_document(&fused);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].chunk_id, "c2");
        assert_eq!(best[1].document_id, "d2");
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("Hello, world!"), "\"hello\" OR \"world\"");
        assert_eq!(fts_query("AND OR \"NEAR(\""), "\"and\" OR \"or\" OR \"near\"");
        assert_eq!(fts_query("  ?! "), "");
        assert_eq!(fts_query("a a A"), "\"a\"");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!(matches!(
            "fuzzy".parse::<SearchMode>(),
            Err(KbError::BadRequest(_))
        ));
        assert_eq!(SearchMode::Keyword.alpha(0.6), 0.0);
        assert_eq!(SearchMode::Hybrid.alpha(0.6), 0.6);
    }
}
