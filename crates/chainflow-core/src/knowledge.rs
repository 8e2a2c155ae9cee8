//! Knowledge augmentation — optional enrichment of a step's query with
//! retrieved reference text. Retrieval itself belongs to a
//! [`KnowledgeRetriever`] implementation; failures here never fail a step.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }
}

/// A step's knowledge reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KnowledgeSpec {
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub mode: RetrievalMode,
}

impl KnowledgeSpec {
    pub fn new(refs: Vec<String>, mode: RetrievalMode) -> Self {
        Self { refs, mode }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KnowledgeError {
    #[error("No knowledge retriever configured")]
    NotConfigured,

    #[error("Knowledge retrieval returned no text")]
    Empty,

    #[error("Knowledge retrieval failed: {0}")]
    Retrieval(String),
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn query(
        &self,
        text: &str,
        refs: &[String],
        mode: RetrievalMode,
    ) -> Result<String, KnowledgeError>;
}

/// `"<query>\n\nRelated knowledge: <retrieved>"`
pub fn augment_query(query: &str, retrieved: &str) -> String {
    format!("{}\n\nRelated knowledge: {}", query, retrieved)
}

/// Retrieve and merge knowledge into `query`.
pub async fn augment(
    retriever: Option<&dyn KnowledgeRetriever>,
    query: &str,
    spec: &KnowledgeSpec,
) -> Result<String, KnowledgeError> {
    let retriever = retriever.ok_or(KnowledgeError::NotConfigured)?;
    let retrieved = retriever.query(query, &spec.refs, spec.mode).await?;
    let retrieved = retrieved.trim();
    if retrieved.is_empty() {
        return Err(KnowledgeError::Empty);
    }
    Ok(augment_query(query, retrieved))
}

// ─── Static knowledge ─────────────────────────────────────────────────────

/// In-memory retriever over fixed documents grouped by knowledge ref.
///
/// `Semantic` returns every document of the referenced groups; `Keyword`
/// returns only documents sharing a word (≥ 3 chars) with the query;
/// `Hybrid` prefers keyword hits and falls back to the whole group.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledge {
    documents: HashMap<String, Vec<String>>,
}

impl StaticKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, knowledge_ref: impl Into<String>, text: impl Into<String>) -> Self {
        self.add_document(knowledge_ref, text);
        self
    }

    pub fn add_document(&mut self, knowledge_ref: impl Into<String>, text: impl Into<String>) {
        self.documents
            .entry(knowledge_ref.into())
            .or_default()
            .push(text.into());
    }

    fn keyword_hits<'a>(query: &str, docs: &[&'a String]) -> Vec<&'a String> {
        let words: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
            .map(str::to_lowercase)
            .collect();
        docs.iter()
            .copied()
            .filter(|doc| {
                let doc = doc.to_lowercase();
                words.iter().any(|w| doc.contains(w.as_str()))
            })
            .collect()
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticKnowledge {
    async fn query(
        &self,
        text: &str,
        refs: &[String],
        mode: RetrievalMode,
    ) -> Result<String, KnowledgeError> {
        let docs: Vec<&String> = refs
            .iter()
            .filter_map(|r| self.documents.get(r))
            .flatten()
            .collect();

        let selected = match mode {
            RetrievalMode::Semantic => docs,
            RetrievalMode::Keyword => Self::keyword_hits(text, &docs),
            RetrievalMode::Hybrid => {
                let hits = Self::keyword_hits(text, &docs);
                if hits.is_empty() {
                    docs
                } else {
                    hits
                }
            }
        };

        Ok(selected
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl KnowledgeRetriever for Failing {
        async fn query(&self, _: &str, _: &[String], _: RetrievalMode) -> Result<String, KnowledgeError> {
            Err(KnowledgeError::Retrieval("index offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_augment_format() {
        let kb = StaticKnowledge::new().with_document("geo", "Paris is in France.");
        let spec = KnowledgeSpec::new(vec!["geo".to_string()], RetrievalMode::Semantic);
        let q = augment(Some(&kb as &dyn KnowledgeRetriever), "Where is Paris?", &spec).await.unwrap();
        assert_eq!(q, "Where is Paris?\n\nRelated knowledge: Paris is in France.");
    }

    #[tokio::test]
    async fn test_keyword_mode_filters_documents() {
        let kb = StaticKnowledge::new()
            .with_document("geo", "Paris is in France.")
            .with_document("geo", "Berlin is in Germany.");
        let text = kb
            .query("capital of germany", &["geo".to_string()], RetrievalMode::Keyword)
            .await
            .unwrap();
        assert_eq!(text, "Berlin is in Germany.");
    }

    #[tokio::test]
    async fn test_augment_errors_are_reported() {
        let spec = KnowledgeSpec::new(vec!["geo".to_string()], RetrievalMode::Semantic);
        assert_eq!(
            augment(None, "q", &spec).await,
            Err(KnowledgeError::NotConfigured)
        );
        assert!(matches!(
            augment(Some(&Failing as &dyn KnowledgeRetriever), "q", &spec).await,
            Err(KnowledgeError::Retrieval(_))
        ));
        let empty = StaticKnowledge::new();
        assert_eq!(
            augment(Some(&empty as &dyn KnowledgeRetriever), "q", &spec).await,
            Err(KnowledgeError::Empty)
        );
    }
}
