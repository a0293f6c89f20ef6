// Client configuration consumed by the gateway and the realtime channel.

use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Endpoints and transport settings for one API deployment.
///
/// `ws_url` is optional: runtimes without a realtime endpoint configured
/// get no subscription capability, and the facade's `subscribe` returns
/// `None` there.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The GraphQL endpoint, e.g. `https://api.crm.dealflow.dev/graphql`.
    pub api_url: Url,

    /// The realtime endpoint, e.g. `wss://api.crm.dealflow.dev/graphql`.
    pub ws_url: Option<Url>,

    pub transport: TransportConfig,
}

impl ClientConfig {
    /// Configuration for an endpoint, with transport defaults and no
    /// realtime capability.
    pub fn new(api_url: &str) -> Result<Self, Error> {
        Ok(Self {
            api_url: Url::parse(api_url)?,
            ws_url: None,
            transport: TransportConfig::default(),
        })
    }

    /// Add the realtime endpoint.
    pub fn with_ws_url(mut self, ws_url: &str) -> Result<Self, Error> {
        self.ws_url = Some(Url::parse(ws_url)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}
