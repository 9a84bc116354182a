use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use crate::models::{ToolDescriptor, ToolMetadata, ToolReference, namespaced_name};

/// English stop words excluded from BM25 keyword extraction, alongside the
/// length <= 2 rule.
static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "can", "could", "did", "do", "does",
        "for", "from", "had", "has", "have", "he", "her", "him", "his", "how", "i", "if", "in",
        "into", "is", "it", "its", "may", "might", "must", "my", "no", "not", "of", "on", "or",
        "our", "shall", "she", "should", "so", "some", "such", "than", "that", "the", "their",
        "them", "then", "there", "these", "they", "this", "those", "to", "too", "was", "we",
        "were", "what", "when", "where", "which", "who", "whom", "whose", "will", "with",
        "would", "you", "your", "get", "me", "myself", "yourself", "himself", "herself",
        "itself", "ourselves", "themselves", "am", "being", "been", "having", "doing", "but",
        "because", "until", "while", "about", "against", "between", "through", "during",
        "before", "after", "above", "below", "up", "down", "out", "off", "over", "under",
        "again", "further", "once", "here", "all", "any", "both", "each", "few", "more",
        "most", "other", "nor", "only", "own", "same", "very", "just", "now",
    ]
    .into_iter()
    .collect()
});

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-zA-Z_]+\b").expect("word pattern is valid"));

/// Closed table of semantic equivalents used to boost related terms.
fn semantic_equivalents(keyword: &str) -> &'static [&'static str] {
    match keyword {
        "search" => &["query", "find", "lookup", "fetch", "get"],
        "query" => &["search", "find", "lookup"],
        "documentation" => &["docs", "document", "guide", "reference", "manual"],
        "docs" => &["documentation", "document", "guide"],
        "library" => &["package", "module", "dependency"],
        "mcp" => &["model", "context", "protocol"],
        _ => &[],
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),
}

/// A tool in the in-memory search index.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    pub server_name: String,
    pub tool_name: String,
    pub namespaced_name: String,
    pub description: String,
    pub input_schema: Value,
    pub searchable_text: String,
    pub defer_loading: bool,
}

impl IndexedTool {
    fn to_reference(&self) -> ToolReference {
        ToolReference {
            server_name: self.server_name.clone(),
            tool_name: self.tool_name.clone(),
            namespaced_name: self.namespaced_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            defer_loading: self.defer_loading,
        }
    }
}

/// In-memory tool index with regex and BM25-style ranked search.
///
/// Entries keep insertion order; re-indexing an existing namespaced name
/// replaces it in place. The index is a derived view, rebuilt from stored
/// metadata and never persisted.
#[derive(Default)]
pub struct SearchIndex {
    tools: Vec<IndexedTool>,
}

/// Concatenate the searchable fields of a tool. Weighted construction
/// duplicates name and description so they dominate occurrence counts.
fn build_searchable_text(
    tool_name: &str,
    description: &str,
    input_schema: &Value,
    apply_weighting: bool,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if apply_weighting && !tool_name.is_empty() {
        parts.push(tool_name.to_string());
    }
    parts.push(tool_name.to_string());

    if apply_weighting && !description.is_empty() {
        parts.push(description.to_string());
    }
    parts.push(description.to_string());

    if let Some(properties) = input_schema.get("properties").and_then(Value::as_object) {
        for (prop_name, prop_data) in properties {
            parts.push(prop_name.clone());
            if let Some(obj) = prop_data.as_object() {
                if let Some(desc) = obj.get("description").and_then(Value::as_str) {
                    parts.push(desc.to_string());
                }
                if let Some(variants) = obj.get("enum").and_then(Value::as_array) {
                    for variant in variants {
                        parts.push(stringify(variant));
                    }
                }
            }
        }
    }

    if let Some(required) = input_schema.get("required").and_then(Value::as_array) {
        for entry in required {
            parts.push(stringify(entry));
        }
    }

    parts.retain(|part| !part.is_empty());
    parts.join(" ")
}

/// Plain string form of a JSON value: strings unquoted, everything else in
/// its JSON rendering.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lowercased keywords from a query: letter/underscore runs, minus stop
/// words and tokens of length <= 2.
fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w.as_str()))
        .collect()
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&mut self, tool: IndexedTool) {
        match self
            .tools
            .iter_mut()
            .find(|t| t.namespaced_name == tool.namespaced_name)
        {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    /// Index one discovered tool with weighted searchable text.
    pub fn index_tool(&mut self, server_name: &str, tool: &ToolDescriptor) {
        let searchable_text =
            build_searchable_text(&tool.name, &tool.description, &tool.input_schema, true);
        self.upsert(IndexedTool {
            server_name: server_name.to_string(),
            tool_name: tool.name.clone(),
            namespaced_name: namespaced_name(server_name, &tool.name),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            searchable_text,
            defer_loading: true,
        });
    }

    pub fn index_tools(&mut self, server_name: &str, tools: &[ToolDescriptor]) {
        for tool in tools {
            self.index_tool(server_name, tool);
        }
    }

    /// Index a tool from stored metadata (unweighted text). Used to rebuild
    /// the index without rediscovering downstream servers.
    pub fn index_tool_metadata(&mut self, meta: &ToolMetadata) {
        if meta.namespaced_name.is_empty() {
            return;
        }
        let searchable_text = build_searchable_text(
            &meta.tool_name,
            &meta.description,
            &meta.input_schema,
            false,
        );
        self.upsert(IndexedTool {
            server_name: meta.server_name.clone(),
            tool_name: meta.tool_name.clone(),
            namespaced_name: meta.namespaced_name.clone(),
            description: meta.description.clone(),
            input_schema: meta.input_schema.clone(),
            searchable_text,
            defer_loading: true,
        });
    }

    pub fn index_all_metadata(&mut self, metadata: &[ToolMetadata]) {
        for meta in metadata {
            self.index_tool_metadata(meta);
        }
    }

    /// Drop every indexed tool whose namespaced name starts with
    /// `{server_name}__`.
    pub fn remove_server_tools(&mut self, server_name: &str) {
        let prefix = namespaced_name(server_name, "");
        self.tools.retain(|t| !t.namespaced_name.starts_with(&prefix));
    }

    /// Case-insensitive regex search over searchable text, insertion order.
    pub fn search_regex(&self, query: &str, limit: usize) -> Result<Vec<ToolReference>, SearchError> {
        let pattern = RegexBuilder::new(query)
            .case_insensitive(true)
            .build()
            .map_err(|e| SearchError::InvalidPattern(e.to_string()))?;

        Ok(self
            .tools
            .iter()
            .filter(|t| pattern.is_match(&t.searchable_text))
            .take(limit)
            .map(IndexedTool::to_reference)
            .collect())
    }

    /// BM25-style ranked search. No extractable keywords means no results.
    /// Ties keep insertion order; scoring is deterministic for a fixed index.
    pub fn search_bm25(&self, query: &str, limit: usize) -> Vec<ToolReference> {
        let keywords = extract_keywords(query);
        debug!(query = %query, keywords = ?keywords, "bm25 search");
        if keywords.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &IndexedTool)> = self
            .tools
            .iter()
            .filter_map(|tool| {
                let score = score_tool(&keywords, tool);
                (score > 0.0).then_some((score, tool))
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(_, tool)| tool.to_reference())
            .collect()
    }

    /// Unified entry point: regex when requested, BM25 otherwise.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        use_regex: bool,
    ) -> Result<Vec<ToolReference>, SearchError> {
        if use_regex {
            self.search_regex(query, limit)
        } else {
            Ok(self.search_bm25(query, limit))
        }
    }

    #[allow(dead_code)]
    pub fn get_all_tools(&self) -> Vec<ToolReference> {
        self.tools.iter().map(IndexedTool::to_reference).collect()
    }

    #[allow(dead_code)]
    pub fn get_tool(&self, namespaced: &str) -> Option<ToolReference> {
        self.tools
            .iter()
            .find(|t| t.namespaced_name == namespaced)
            .map(IndexedTool::to_reference)
    }
}

/// Relevance score for one tool against the extracted query keywords.
fn score_tool(keywords: &[String], tool: &IndexedTool) -> f64 {
    let tool_name = tool.tool_name.to_lowercase();
    let description = tool.description.to_lowercase();
    let searchable_text = tool.searchable_text.to_lowercase();

    let mut score = 0.0f64;
    let mut name_matches = 0usize;
    let mut desc_matches = 0usize;

    for keyword in keywords {
        let keyword = keyword.as_str();

        if tool_name.contains(keyword) {
            score += 8.0;
            name_matches += 1;
            if tool_name.starts_with(keyword) {
                score += 4.0;
            }
        }

        // Description matches carry the most weight, with a bonus for
        // appearing in the leading 100 characters
        if description.contains(keyword) {
            score += 15.0;
            desc_matches += 1;
            let head: String = description.chars().take(100).collect();
            if head.contains(keyword) {
                score += 5.0;
            }
        }

        let count = searchable_text.matches(keyword).count();
        score += count as f64 * 0.5;

        for equivalent in semantic_equivalents(keyword) {
            if tool_name.contains(equivalent) {
                score += 5.0;
            }
            if description.contains(equivalent) {
                score += 8.0;
            }
        }

        // Partial-word matches: keyword embedded in a longer word
        for word in tool_name.replace(['_', '-'], " ").split_whitespace() {
            if word.len() > 3 && word.contains(keyword) && word != keyword {
                score += 2.0;
            }
        }
        for word in description.split_whitespace() {
            let word = word.trim_matches(|c| matches!(c, '.' | ',' | ';' | ':'));
            if word.len() > 3 && word.contains(keyword) && word != keyword {
                score += 1.0;
            }
        }
    }

    // Post-scaling: first matching rule only
    if name_matches > 0 && desc_matches > 0 {
        score *= 2.0;
    } else if desc_matches >= keywords.len() {
        score *= 1.8;
    } else if (name_matches + desc_matches) as f64 >= keywords.len() as f64 * 0.7 {
        score *= 1.4;
    }

    score
}
