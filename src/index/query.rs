//! Structured Queries over Loaded Fragments
//!
//! Queries are answered from already-materialized payloads only. A query whose
//! target does not exist in the payload is a miss.

use std::fmt;

use serde_json::{json, Map, Value};

use super::graph::FragmentId;
use crate::cache::CacheKey;

/// A read against one fragment's payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StructuredQuery {
    /// The whole payload
    Fragment(FragmentId),
    /// RFC 6901 pointer into the payload (e.g. `/concept_index/love`)
    Pointer { fragment: FragmentId, pointer: String },
    /// Case-insensitive substring search over the keys of the map at `pointer`
    Search {
        fragment: FragmentId,
        pointer: String,
        needle: String,
        limit: usize,
    },
}

impl StructuredQuery {
    pub fn fragment(id: impl Into<FragmentId>) -> Self {
        Self::Fragment(id.into())
    }

    pub fn pointer(fragment: impl Into<FragmentId>, pointer: impl Into<String>) -> Self {
        Self::Pointer {
            fragment: fragment.into(),
            pointer: pointer.into(),
        }
    }

    pub fn search(
        fragment: impl Into<FragmentId>,
        pointer: impl Into<String>,
        needle: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self::Search {
            fragment: fragment.into(),
            pointer: pointer.into(),
            needle: needle.into(),
            limit,
        }
    }

    /// Fragment the query reads
    pub fn target(&self) -> &str {
        match self {
            Self::Fragment(fragment)
            | Self::Pointer { fragment, .. }
            | Self::Search { fragment, .. } => fragment,
        }
    }

    /// Decode an index-namespace key: `<fragment>` or `<fragment>#<pointer>`
    pub fn from_key(key: &CacheKey) -> Option<Self> {
        if !key.is_index() {
            return None;
        }
        match key.id().split_once('#') {
            None => Some(Self::fragment(key.id())),
            Some((fragment, _)) if fragment.is_empty() => None,
            Some((fragment, pointer)) => Some(Self::pointer(fragment, pointer)),
        }
    }

    /// Index-namespace key for this query. Searches are not key-addressable.
    pub fn to_key(&self) -> Option<CacheKey> {
        match self {
            Self::Fragment(fragment) => Some(CacheKey::index(fragment.as_str())),
            Self::Pointer { fragment, pointer } => Some(CacheKey::index(format!("{fragment}#{pointer}"))),
            Self::Search { .. } => None,
        }
    }

    /// Answer the query from a loaded payload
    pub fn evaluate(&self, payload: &Value) -> Option<Value> {
        match self {
            Self::Fragment(_) => Some(payload.clone()),
            Self::Pointer { pointer, .. } => payload.pointer(pointer).cloned(),
            Self::Search {
                pointer,
                needle,
                limit,
                ..
            } => {
                let map = payload.pointer(pointer)?.as_object()?;
                Some(Value::Array(search_keys(map, needle, *limit)))
            }
        }
    }
}

impl fmt::Display for StructuredQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fragment(fragment) => write!(f, "{fragment}"),
            Self::Pointer { fragment, pointer } => write!(f, "{fragment}#{pointer}"),
            Self::Search {
                fragment,
                pointer,
                needle,
                limit,
            } => write!(f, "{fragment}#{pointer}?q={needle}&limit={limit}"),
        }
    }
}

/// Matches ranked by the size of the matched value, exact key matches doubled
fn search_keys(map: &Map<String, Value>, needle: &str, limit: usize) -> Vec<Value> {
    let needle = needle.to_lowercase();
    let mut hits: Vec<(u64, &String, &Value, bool)> = map
        .iter()
        .filter_map(|(key, value)| {
            let lowered = key.to_lowercase();
            if !lowered.contains(&needle) {
                return None;
            }
            let weight = match value {
                Value::Array(items) => items.len() as u64,
                Value::Object(fields) => fields.len() as u64,
                _ => 1,
            };
            let exact = lowered == needle;
            Some((if exact { weight * 2 } else { weight }, key, value, exact))
        })
        .collect();

    hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    hits.into_iter()
        .take(limit)
        .map(|(relevance, key, value, exact)| {
            json!({
                "key": key,
                "value": value,
                "relevance": relevance,
                "exact_match": exact,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concepts() -> Value {
        json!({
            "concept_index": {
                "love": [1, 2, 3],
                "Self-Love": [4],
                "loveliness": [5, 6, 7, 8, 9, 10, 11],
                "fear": [12]
            }
        })
    }

    #[test]
    fn test_pointer_lookup() {
        let query = StructuredQuery::pointer("concepts_index", "/concept_index/fear");
        assert_eq!(query.evaluate(&concepts()), Some(json!([12])));

        let missing = StructuredQuery::pointer("concepts_index", "/concept_index/joy");
        assert_eq!(missing.evaluate(&concepts()), None);
    }

    #[test]
    fn test_search_ranks_by_size_and_exactness() {
        let query = StructuredQuery::search("concepts_index", "/concept_index", "LOVE", 10);
        let results = query.evaluate(&concepts()).unwrap();
        let keys: Vec<&str> = results
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["key"].as_str().unwrap())
            .collect();

        // loveliness: 7, love: 3 * 2 exact, Self-Love: 1
        assert_eq!(keys, vec!["loveliness", "love", "Self-Love"]);
        assert_eq!(results[1]["exact_match"], json!(true));
        assert_eq!(results[1]["relevance"], json!(6));
    }

    #[test]
    fn test_search_limit_and_non_map_target() {
        let query = StructuredQuery::search("concepts_index", "/concept_index", "love", 1);
        assert_eq!(query.evaluate(&concepts()).unwrap().as_array().unwrap().len(), 1);

        let query = StructuredQuery::search("concepts_index", "/concept_index/love", "x", 5);
        assert_eq!(query.evaluate(&concepts()), None);
    }

    #[test]
    fn test_key_round_trip() {
        let query = StructuredQuery::pointer("lesson_date_mapper", "/dates/01-15");
        let key = query.to_key().unwrap();
        assert_eq!(key.to_string(), "index:lesson_date_mapper#/dates/01-15");
        assert_eq!(StructuredQuery::from_key(&key), Some(query));

        let whole = CacheKey::index("lesson_mapper");
        assert_eq!(
            StructuredQuery::from_key(&whole),
            Some(StructuredQuery::fragment("lesson_mapper"))
        );
        assert_eq!(StructuredQuery::from_key(&CacheKey::new("lesson", "1").unwrap()), None);
        assert_eq!(StructuredQuery::from_key(&CacheKey::index("#/x")), None);
    }
}
