// Session lifecycle against the remote API.
//
// Login, logout, the session probe, and the identity fetch. The token
// slot is the only session state this layer keeps: conceptually the
// session moves Anonymous -> Authenticating -> Authenticated (or Error),
// with logout always returning to Anonymous, but no state field exists
// -- every authorization decision is delegated per-call to the server,
// and the slot's contents are the single source of truth.
//
// Failures here become non-throwing outcome values: the UI renders
// redirects and notifications from them instead of handling errors.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Error;
use crate::provider::DataProvider;
use crate::token::TokenStore;

const LOGIN_MUTATION: &str =
    "mutation Login($email: String!) { login(loginInput: { email: $email }) { accessToken } }";

const CHECK_QUERY: &str = "query Me { me { name } }";

const IDENTITY_QUERY: &str =
    "query Me { me { id name email phone jobTitle timezone avatarUrl } }";

/// Result of a [`login`](AuthSession::login) attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub success: bool,
    pub redirect_to: Option<String>,
    pub error: Option<AuthFailure>,
}

/// Why a login was rejected, in the shape the console's notification
/// layer expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub message: String,
    pub name: String,
}

/// Result of [`logout`](AuthSession::logout). Always successful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    pub success: bool,
    pub redirect_to: String,
}

/// Result of the [`check`](AuthSession::check) probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub authenticated: bool,
    pub redirect_to: String,
}

/// What the caller should do with an error it routed through
/// [`on_error`](AuthSession::on_error).
#[derive(Debug)]
pub enum ErrorDirective {
    /// The server no longer recognizes the session: force a logout, then
    /// surface the error.
    ForceLogout(Error),
    /// Any other failure: surface the error unchanged.
    PassThrough(Error),
}

impl ErrorDirective {
    pub fn should_logout(&self) -> bool {
        matches!(self, Self::ForceLogout(_))
    }

    pub fn error(&self) -> &Error {
        match self {
            Self::ForceLogout(e) | Self::PassThrough(e) => e,
        }
    }
}

/// The authenticated user's profile, fetched fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct LoginData {
    login: LoginToken,
}

#[derive(Deserialize)]
struct LoginToken {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Deserialize)]
struct IdentityData {
    me: Identity,
}

/// Session lifecycle operations for the admin console.
pub struct AuthSession {
    provider: Arc<DataProvider>,
    tokens: Arc<dyn TokenStore>,
}

impl AuthSession {
    pub fn new(provider: Arc<DataProvider>, tokens: Arc<dyn TokenStore>) -> Self {
        Self { provider, tokens }
    }

    /// Authenticate with an email (password-less demo flow) and persist
    /// the returned token.
    ///
    /// Two concurrent logins race without ordering: the slot holds
    /// whichever token was written last.
    pub async fn login(&self, email: &str) -> LoginOutcome {
        let mut variables = Map::new();
        variables.insert("email".to_owned(), Value::String(email.to_owned()));

        let data = match self
            .provider
            .custom(LOGIN_MUTATION, variables, HashMap::new())
            .await
        {
            Ok(data) => data,
            Err(e) => return Self::rejected(&e),
        };

        let parsed: LoginData = match serde_json::from_value(data.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Self::rejected(&Error::Deserialization {
                    message: format!("malformed login response: {e}"),
                    body: data.to_string(),
                });
            }
        };

        if let Err(e) = self
            .tokens
            .set(SecretString::from(parsed.login.access_token))
        {
            return Self::rejected(&e);
        }

        debug!("login successful");
        LoginOutcome {
            success: true,
            redirect_to: Some("/".to_owned()),
            error: None,
        }
    }

    /// End the session. Always succeeds, even when no session existed.
    pub fn logout(&self) -> LogoutOutcome {
        if let Err(e) = self.tokens.clear() {
            tracing::warn!(error = %e, "failed to clear token slot");
        }
        LogoutOutcome {
            success: true,
            redirect_to: "/login".to_owned(),
        }
    }

    /// Probe whether the current token is still accepted.
    ///
    /// Never mutates the slot: a rejected probe redirects to the login
    /// page and leaves the stored token for [`logout`](Self::logout) (or
    /// a retried login) to replace.
    pub async fn check(&self) -> CheckOutcome {
        match self.provider.custom(CHECK_QUERY, Map::new(), HashMap::new()).await {
            Ok(_) => CheckOutcome {
                authenticated: true,
                redirect_to: "/".to_owned(),
            },
            Err(e) => {
                debug!(error = %e, "session check failed");
                CheckOutcome {
                    authenticated: false,
                    redirect_to: "/login".to_owned(),
                }
            }
        }
    }

    /// Classify an error the UI caught while rendering data.
    ///
    /// Only `UNAUTHENTICATED` has systemic meaning; every other status
    /// code is an opaque pass-through value.
    pub fn on_error(&self, error: Error) -> ErrorDirective {
        if error.is_unauthenticated() {
            ErrorDirective::ForceLogout(error)
        } else {
            ErrorDirective::PassThrough(error)
        }
    }

    /// Fetch the authenticated user's profile, or `None` on any failure.
    ///
    /// Network and authorization failures are not distinguished here --
    /// an absent identity renders the same either way.
    pub async fn identity(&self) -> Option<Identity> {
        let mut headers = HashMap::new();
        if let Some(token) = self.tokens.get() {
            headers.insert(
                "Authorization".to_owned(),
                format!("Bearer {}", token.expose_secret()),
            );
        }

        match self.provider.custom(IDENTITY_QUERY, Map::new(), headers).await {
            Ok(data) => serde_json::from_value::<IdentityData>(data)
                .map(|d| d.me)
                .ok(),
            Err(e) => {
                debug!(error = %e, "identity fetch failed");
                None
            }
        }
    }

    fn rejected(error: &Error) -> LoginOutcome {
        let message = match error {
            Error::Graphql { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        };
        let message = if message.is_empty() {
            "login failed".to_owned()
        } else {
            message
        };

        LoginOutcome {
            success: false,
            redirect_to: None,
            error: Some(AuthFailure {
                message,
                name: "Invalid email or Password".to_owned(),
            }),
        }
    }
}
