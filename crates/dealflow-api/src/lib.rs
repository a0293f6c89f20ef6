// dealflow-api: Async data-access layer for the Dealflow CRM GraphQL API.
//
// Everything the admin console knows about the network lives here: the
// token slot, the authenticated HTTP gateway, the session lifecycle, the
// realtime subscription channel, and the resource-oriented facade that
// ties them together. Rendering, routing, and optimistic-update
// reconciliation belong to the consumer.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod graphql;
pub mod provider;
pub mod subscription;
pub mod token;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use auth::{
    AuthFailure, AuthSession, CheckOutcome, ErrorDirective, Identity, LoginOutcome, LogoutOutcome,
};
pub use config::ClientConfig;
pub use error::Error;
pub use gateway::Gateway;
pub use graphql::{ErrorExtensions, GraphqlErrorEntry, GraphqlRequest, GraphqlResponse};
pub use provider::{DataProvider, MutationAction, MutationMode, RecordPage};
pub use subscription::{ReconnectConfig, SubscriptionChannel, SubscriptionStream};
pub use token::{FileTokenStore, MemoryTokenStore, TOKEN_SLOT, TokenStore};
pub use transport::{TlsMode, TransportConfig};
