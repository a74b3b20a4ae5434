//! Backend identity and reply types

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque name of one interchangeable backend (e.g. `"openai/gpt-4"`).
///
/// Cheap to clone; ordering is lexical and used as the final tie-break in
/// every ranking so results stay deterministic.
/// Serialized as a plain string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendId({:?})", &*self.0)
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BackendId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for BackendId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for BackendId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BackendId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Rough usage estimate for backends that report none: 1.3 tokens per word.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let tokens = |s: &str| (s.split_whitespace().count() as f64 * 1.3).round() as u32;
        Self::new(tokens(prompt), tokens(completion))
    }
}

/// What a backend hands back for one successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Cost of this call as reported by the backend, in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Backend-reported quality score in `[0, 1]`, if it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_id_orders_lexically() {
        let mut ids = vec![BackendId::from("b"), BackendId::from("a"), BackendId::from("c")];
        ids.sort();
        let names: Vec<_> = ids.iter().map(BackendId::as_str).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn backend_id_serializes_as_plain_string() {
        let id = BackendId::from("anthropic/claude-3-sonnet");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"anthropic/claude-3-sonnet\""
        );
    }

    #[test]
    fn backend_id_deserializes_from_string_and_map_key() {
        let id: BackendId = serde_json::from_str("\"local/llama\"").unwrap();
        assert_eq!(id.as_str(), "local/llama");

        let map: std::collections::BTreeMap<BackendId, u32> =
            serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        assert_eq!(map[&BackendId::from("b")], 2);
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn usage_estimate_uses_word_count() {
        let usage = Usage::estimate("one two three four five six seven eight nine ten", "");
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 13);
    }
}
