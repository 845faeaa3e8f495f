//! Wire protocol types for the request/response envelope.
//!
//! Field names are a compatibility contract: any implementation speaking
//! this protocol must emit `id`, `type`, `path`, `argumentList`, `value`
//! and `name` exactly as below.

use serde::{Deserialize, Serialize};

/// Correlation token matching a response to the request that issued it.
///
/// Generated ids are UUID v4, but the field stays an opaque string on the
/// wire so peers may use any scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Tagged envelope for any value crossing an endpoint.
///
/// `Raw` is plain data; `Handler` defers to the named transfer handler,
/// which must exist in both sides' registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireValue {
    #[serde(rename = "RAW")]
    Raw {
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        value: serde_json::Value,
    },

    #[serde(rename = "HANDLER")]
    Handler {
        name: String,
        value: serde_json::Value,
    },
}

impl WireValue {
    pub fn raw(value: serde_json::Value) -> Self {
        Self::Raw { value }
    }
}

/// The operation a request asks the dispatcher to perform.
///
/// `path` is the chain of property names from the exposed root; it is
/// recorded once per request and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "GET")]
    Get { path: Vec<String> },

    #[serde(rename = "SET")]
    Set { path: Vec<String>, value: WireValue },

    #[serde(rename = "APPLY")]
    Apply {
        path: Vec<String>,
        #[serde(rename = "argumentList")]
        argument_list: Vec<WireValue>,
    },

    #[serde(rename = "CONSTRUCT")]
    Construct {
        path: Vec<String>,
        #[serde(rename = "argumentList")]
        argument_list: Vec<WireValue>,
    },

    /// Ask for a fresh channel serving the same exposed root.
    #[serde(rename = "ENDPOINT")]
    Endpoint { path: Vec<String> },

    /// Endpoint-scoped teardown; always carries an empty path.
    #[serde(rename = "RELEASE")]
    Release { path: Vec<String> },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::Apply { .. } => "APPLY",
            Self::Construct { .. } => "CONSTRUCT",
            Self::Endpoint { .. } => "ENDPOINT",
            Self::Release { .. } => "RELEASE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub op: Operation,
}

/// A `WireValue` tagged with the id of the request it answers.
///
/// Produced at most once per request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(flatten)]
    pub value: WireValue,
}

/// Anything that can appear on an endpoint: a request or a response.
///
/// The two directions share one channel; the `type` tag sets are disjoint,
/// so discrimination is by tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Packet {
    Request(Request),
    Response(Response),
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let tag = raw.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        match tag {
            "RAW" | "HANDLER" => serde_json::from_value(raw)
                .map(Packet::Response)
                .map_err(serde::de::Error::custom),
            _ => serde_json::from_value(raw)
                .map(Packet::Request)
                .map_err(serde::de::Error::custom),
        }
    }
}
