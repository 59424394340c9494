//! Lexical knowledge retriever.
//!
//! Token-overlap scoring over documents grouped by knowledge base: styling
//! guides, garment care sheets, brand tone notes. Deliberately simple --
//! the production retrieval service is an external collaborator, and this
//! implementation covers embedded deployments and tests with the same
//! query/hit surface.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use stitchflow_core::node::KnowledgeRetriever;
use stitchflow_types::error::NodeError;
use stitchflow_types::retrieval::{RetrievalHit, RetrievalQuery};

/// One indexed document.
#[derive(Debug, Clone)]
pub struct KbDocument {
    pub id: String,
    pub title: String,
    pub text: String,
    pub metadata: Value,
    pub kb_id: String,
}

/// In-memory lexical [`KnowledgeRetriever`].
#[derive(Default)]
pub struct LexicalRetriever {
    /// Documents grouped by knowledge base id.
    docs: DashMap<String, Vec<KbDocument>>,
}

impl LexicalRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&self, doc: KbDocument) {
        self.docs.entry(doc.kb_id.clone()).or_default().push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn candidates(&self, kb_id: Option<&str>) -> Vec<KbDocument> {
        match kb_id {
            Some(kb_id) => self
                .docs
                .get(kb_id)
                .map(|docs| docs.clone())
                .unwrap_or_default(),
            None => self
                .docs
                .iter()
                .flat_map(|entry| entry.value().clone())
                .collect(),
        }
    }
}

/// Lowercased alphanumeric tokens of a text.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Fraction of query tokens present in the document.
fn score(query_tokens: &HashSet<String>, doc: &KbDocument) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokenize(&format!("{} {}", doc.title, doc.text));
    let overlap = query_tokens.intersection(&doc_tokens).count();
    overlap as f32 / query_tokens.len() as f32
}

/// Exact-match metadata filters.
fn matches_filters(doc: &KbDocument, query: &RetrievalQuery) -> bool {
    query
        .filters
        .iter()
        .all(|(key, expected)| doc.metadata.get(key) == Some(expected))
}

#[async_trait]
impl KnowledgeRetriever for LexicalRetriever {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, NodeError> {
        let query_tokens = tokenize(&query.query);

        let mut hits: Vec<RetrievalHit> = self
            .candidates(query.kb_id.as_deref())
            .into_iter()
            .filter(|doc| matches_filters(doc, query))
            .filter_map(|doc| {
                let score = score(&query_tokens, &doc);
                (score > 0.0).then(|| RetrievalHit {
                    id: doc.id,
                    title: doc.title,
                    text: doc.text,
                    metadata: doc.metadata,
                    kb_id: doc.kb_id,
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.top_k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn doc(id: &str, kb_id: &str, title: &str, text: &str, metadata: Value) -> KbDocument {
        KbDocument {
            id: id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
            metadata,
            kb_id: kb_id.to_string(),
        }
    }

    fn seeded() -> LexicalRetriever {
        let retriever = LexicalRetriever::new();
        retriever.add_document(doc(
            "silk-care",
            "care",
            "Silk care",
            "Hand wash silk cold, never tumble dry.",
            json!({ "category": "care" }),
        ));
        retriever.add_document(doc(
            "blazer-style",
            "styling",
            "Blazer styling",
            "Shoot blazers on a half-ghost mannequin with soft shadows.",
            json!({ "category": "styling" }),
        ));
        retriever.add_document(doc(
            "denim-care",
            "care",
            "Denim care",
            "Wash denim inside out in cold water.",
            json!({ "category": "care" }),
        ));
        retriever
    }

    fn query(text: &str) -> RetrievalQuery {
        RetrievalQuery {
            query: text.to_string(),
            kb_id: None,
            top_k: 5,
            filters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_ranked_by_overlap() {
        let retriever = seeded();
        let hits = retriever.search(&query("silk cold wash")).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "silk-care");
        assert!(hits[0].score >= hits.last().unwrap().score);
    }

    #[tokio::test]
    async fn test_kb_scope_restricts_candidates() {
        let retriever = seeded();
        let mut q = query("blazer wash cold");
        q.kb_id = Some("care".to_string());
        let hits = retriever.search(&q).await.unwrap();
        assert!(hits.iter().all(|h| h.kb_id == "care"));
    }

    #[tokio::test]
    async fn test_metadata_filters_are_exact_match() {
        let retriever = seeded();
        let mut q = query("cold wash");
        q.filters
            .insert("category".to_string(), json!("styling"));
        let hits = retriever.search(&q).await.unwrap();
        assert!(hits.is_empty(), "no styling doc mentions cold wash");
    }

    #[tokio::test]
    async fn test_top_k_truncation() {
        let retriever = seeded();
        let mut q = query("cold wash");
        q.top_k = 1;
        let hits = retriever.search(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_no_overlap_returns_empty() {
        let retriever = seeded();
        let hits = retriever.search(&query("quarterly revenue")).await.unwrap();
        assert!(hits.is_empty());
    }
}
