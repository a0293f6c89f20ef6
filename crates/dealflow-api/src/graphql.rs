// GraphQL wire shapes shared by the HTTP gateway and the realtime channel.
//
// A request is a document plus a variable map; the response envelope is
// `{ data, errors }` with per-error `extensions.code`. The gateway owns
// error normalization -- these types just model the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single GraphQL operation: document text, variables, and optional
/// per-request header overrides.
///
/// Only `query` and `variables` go on the wire. Header overrides apply to
/// the HTTP POST carrying the operation; supplying an `Authorization`
/// entry suppresses the gateway's bearer injection for that call.
#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    /// The operation document (query, mutation, or subscription).
    pub query: String,

    /// Variable name to value.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,

    /// Header overrides for this request only.
    #[serde(skip)]
    pub headers: HashMap<String, String>,
}

impl GraphqlRequest {
    /// Start a request from a raw operation document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: serde_json::Map::new(),
            headers: HashMap::new(),
        }
    }

    /// Attach a variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Attach a header override.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the caller supplied its own `Authorization` header.
    ///
    /// Header names compare case-insensitively, as HTTP requires.
    pub(crate) fn has_authorization(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"))
    }
}

/// The `{ data, errors }` response envelope.
///
/// Servers return HTTP 200 even for failed operations; failure lives in
/// the `errors` array, which the gateway inspects before any caller sees
/// the envelope.
#[derive(Debug, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Value>,

    #[serde(default)]
    pub errors: Vec<GraphqlErrorEntry>,
}

/// One entry of the response `errors` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlErrorEntry {
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub extensions: ErrorExtensions,
}

/// The `extensions` object of an error entry. Only `code` is meaningful
/// to this layer; servers may attach more.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
}
