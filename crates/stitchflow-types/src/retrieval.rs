//! Knowledge-retrieval collaborator types.
//!
//! The retrieval service itself lives outside the core; these types define
//! the query/hit surface a `KbRetrieve` node speaks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_top_k() -> usize {
    5
}

/// A retrieval query issued by a `KbRetrieve` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalQuery {
    /// Free-text query (after variable resolution).
    pub query: String,
    /// Optional knowledge-base scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_id: Option<String>,
    /// Maximum number of hits to return.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Exact-match metadata filters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub filters: HashMap<String, Value>,
}

/// A single ranked retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalHit {
    pub id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub kb_id: String,
    /// Relevance score, higher is better.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_defaults() {
        let q: RetrievalQuery =
            serde_json::from_value(json!({ "query": "silk blouse care" })).unwrap();
        assert_eq!(q.top_k, 5);
        assert!(q.kb_id.is_none());
        assert!(q.filters.is_empty());
    }

    #[test]
    fn test_hit_roundtrip() {
        let hit = RetrievalHit {
            id: "doc-17".to_string(),
            title: "Silk care".to_string(),
            text: "Hand wash cold, hang dry.".to_string(),
            metadata: json!({ "category": "care" }),
            kb_id: "styling".to_string(),
            score: 0.82,
        };
        let json_str = serde_json::to_string(&hit).unwrap();
        assert!(json_str.contains("\"kbId\":\"styling\""));
        let parsed: RetrievalHit = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.id, "doc-17");
    }
}
