use thiserror::Error;

/// Top-level error type for the `dealflow-api` crate.
///
/// Two families matter to callers: [`Transport`](Self::Transport) is a
/// network-level failure (DNS, connection refused, timeout) and propagates
/// unchanged; [`Graphql`](Self::Graphql) is the normalized protocol-level
/// error the gateway raises after inspecting a response body. Everything
/// else is plumbing.
#[derive(Debug, Error)]
pub enum Error {
    // ── Protocol ────────────────────────────────────────────────────
    /// Normalized GraphQL error: the concatenated messages from the
    /// response's `errors` array plus the first error's extension code.
    #[error("GraphQL error ({status_code}): {message}")]
    Graphql { message: String, status_code: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection or handshake failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A header override could not be encoded into an HTTP header.
    #[error("Invalid header {name}")]
    InvalidHeader { name: String },

    // ── Session ─────────────────────────────────────────────────────
    /// The token slot could not be read or written.
    #[error("Token store error: {message}")]
    TokenStore { message: String },

    // ── Usage ───────────────────────────────────────────────────────
    /// Operation not expressible against this API.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

/// Extension code servers attach to authentication failures.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";

impl Error {
    /// Returns `true` if the server rejected the session outright and the
    /// caller should force a logout.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Graphql { status_code, .. } if status_code == UNAUTHENTICATED)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect(_) => true,
            _ => false,
        }
    }

    /// The protocol status code, if this is a normalized GraphQL error.
    pub fn status_code(&self) -> Option<&str> {
        match self {
            Self::Graphql { status_code, .. } => Some(status_code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_predicate() {
        let err = Error::Graphql {
            message: "token expired".into(),
            status_code: UNAUTHENTICATED.into(),
        };
        assert!(err.is_unauthenticated());

        let err = Error::Graphql {
            message: "bad input".into(),
            status_code: "BAD_REQUEST".into(),
        };
        assert!(!err.is_unauthenticated());
        assert_eq!(err.status_code(), Some("BAD_REQUEST"));
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::Graphql {
            message: "no such company".into(),
            status_code: "NOT_FOUND".into(),
        };
        assert_eq!(err.to_string(), "GraphQL error (NOT_FOUND): no such company");
    }
}
