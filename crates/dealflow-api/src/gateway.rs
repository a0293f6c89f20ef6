// GraphQL HTTP gateway
//
// Wraps outbound POSTs to the GraphQL endpoint: injects the bearer token
// unless the caller supplied its own Authorization header, always sends
// JSON content-type plus the Apollo preflight-signaling header, and
// normalizes protocol-level failures from the response's `errors` array
// into `Error::Graphql` before any caller parses data.

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::graphql::{GraphqlRequest, GraphqlResponse};
use crate::token::TokenStore;

/// Apollo Server rejects JSON POSTs without this header when its CSRF
/// prevention is enabled.
const APOLLO_REQUIRE_PREFLIGHT: &str = "apollo-require-preflight";

/// Authenticated HTTP transport for GraphQL operations.
///
/// The token store is read on every call, so a login or logout anywhere
/// in the process is visible to the next request without rebuilding the
/// gateway.
pub struct Gateway {
    http: reqwest::Client,
    endpoint: Url,
    tokens: Arc<dyn TokenStore>,
}

impl Gateway {
    /// Build a gateway from a client config.
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, Error> {
        Ok(Self {
            http: config.transport.build_client()?,
            endpoint: config.api_url.clone(),
            tokens,
        })
    }

    /// Wrap an existing `reqwest::Client` (tests, shared pools).
    pub fn from_reqwest(
        endpoint: &str,
        http: reqwest::Client,
        tokens: Arc<dyn TokenStore>,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            endpoint: Url::parse(endpoint)?,
            tokens,
        })
    }

    /// The GraphQL endpoint this gateway posts to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Execute one operation and return the response envelope.
    ///
    /// Transport failures surface as [`Error::Transport`] unchanged. A
    /// non-empty `errors` array fails with [`Error::Graphql`] instead of
    /// returning -- callers never see an envelope carrying errors.
    pub async fn execute(&self, request: &GraphqlRequest) -> Result<GraphqlResponse, Error> {
        let headers = self.build_headers(request)?;

        debug!(endpoint = %self.endpoint, "POST GraphQL operation");

        let resp = self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let body = resp.text().await?;
        let envelope = parse_envelope(&body)?;

        if let Some(err) = protocol_error(&envelope) {
            return Err(err);
        }
        Ok(envelope)
    }

    /// Execute one operation and deserialize its `data` field.
    pub async fn execute_data<T: DeserializeOwned>(
        &self,
        request: &GraphqlRequest,
    ) -> Result<T, Error> {
        let envelope = self.execute(request).await?;
        let data = envelope
            .data
            .filter(|d| !d.is_null())
            .ok_or_else(|| Error::Graphql {
                message: "response contained no data".into(),
                status_code: "INTERNAL_SERVER_ERROR".into(),
            })?;

        serde_json::from_value(data.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: data.to_string(),
        })
    }

    /// Header assembly: caller overrides first, then bearer injection if
    /// the caller did not claim Authorization, then the two headers every
    /// request carries.
    fn build_headers(&self, request: &GraphqlRequest) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();

        for (name, value) in &request.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                Error::InvalidHeader { name: name.clone() }
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| Error::InvalidHeader {
                name: name.clone(),
            })?;
            headers.insert(header, value);
        }

        if !request.has_authorization() {
            if let Some(token) = self.tokens.get() {
                let mut bearer = HeaderValue::from_str(&format!(
                    "Bearer {}",
                    token.expose_secret()
                ))
                .map_err(|_| Error::InvalidHeader {
                    name: "Authorization".into(),
                })?;
                bearer.set_sensitive(true);
                headers.insert(AUTHORIZATION, bearer);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(APOLLO_REQUIRE_PREFLIGHT),
            HeaderValue::from_static("true"),
        );

        Ok(headers)
    }
}

/// Parse the response body. An empty or `null` body is a protocol error
/// in its own right -- the server answered without a GraphQL envelope.
fn parse_envelope(body: &str) -> Result<GraphqlResponse, Error> {
    if body.trim().is_empty() {
        return Err(Error::Graphql {
            message: "empty response body".into(),
            status_code: "INTERNAL_SERVER_ERROR".into(),
        });
    }

    let value: Value = serde_json::from_str(body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: body.to_owned(),
    })?;

    if value.is_null() {
        return Err(Error::Graphql {
            message: "empty response body".into(),
            status_code: "INTERNAL_SERVER_ERROR".into(),
        });
    }

    serde_json::from_value(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: body.to_owned(),
    })
}

/// Inspect the envelope's `errors` array and build the normalized error:
/// all messages concatenated, plus the first error's extension code
/// (default `"500"`).
fn protocol_error(envelope: &GraphqlResponse) -> Option<Error> {
    if envelope.errors.is_empty() {
        return None;
    }

    let message: String = envelope
        .errors
        .iter()
        .map(|e| e.message.as_str())
        .collect();
    let message = if message.is_empty() {
        // No messages at all: surface the raw entries rather than nothing.
        serde_json::to_string(&envelope.errors).unwrap_or_default()
    } else {
        message
    };

    let status_code = envelope
        .errors
        .first()
        .and_then(|e| e.extensions.code.clone())
        .unwrap_or_else(|| "500".to_owned());

    Some(Error::Graphql { message, status_code })
}
