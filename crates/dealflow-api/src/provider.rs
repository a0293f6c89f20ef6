// Resource-oriented data access facade
//
// Composes the HTTP gateway and the realtime channel into the
// query/mutate/custom/subscribe surface the admin console consumes.
// Documents follow the server's CRUD conventions: list fields return a
// `{ nodes, totalCount }` page, single-record mutations are the
// `createOne`/`updateOne`/`deleteOne` family. Gateway errors surface
// unchanged -- this layer adds no handling of its own.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::graphql::GraphqlRequest;
use crate::subscription::{ReconnectConfig, SubscriptionChannel, SubscriptionStream};
use crate::token::TokenStore;

/// Which single-record mutation to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

/// When the caller learns about mutation success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMode {
    /// Await server confirmation; the returned record is the server's.
    Pessimistic,
    /// Report local success immediately while the request completes in
    /// the background. The returned record is the submitted payload
    /// echoed back; this facade performs no rollback if the server later
    /// rejects it -- reconciliation is the caller's responsibility.
    Optimistic,
}

/// One page of a list query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    #[serde(default)]
    pub nodes: Vec<Value>,

    #[serde(default)]
    pub total_count: u64,
}

/// The data-access facade for one API deployment.
///
/// Cheap to share behind an `Arc`; the session layer and every view of
/// the console go through the same instance.
pub struct DataProvider {
    gateway: Arc<Gateway>,
    live: Option<SubscriptionChannel>,
}

impl DataProvider {
    /// Wire up the full facade from a client config.
    ///
    /// The realtime channel exists only when `config.ws_url` is set;
    /// without it `subscribe` returns `None`. Must be called from within
    /// a tokio runtime when a realtime endpoint is configured.
    pub fn new(
        config: &ClientConfig,
        tokens: Arc<dyn TokenStore>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let gateway = Arc::new(Gateway::new(config, Arc::clone(&tokens))?);
        let live = config.ws_url.clone().map(|ws_url| {
            SubscriptionChannel::new(ws_url, tokens, ReconnectConfig::default(), cancel)
        });
        Ok(Self { gateway, live })
    }

    /// Compose from parts (tests, custom channel settings).
    pub fn from_gateway(gateway: Arc<Gateway>, live: Option<SubscriptionChannel>) -> Self {
        Self { gateway, live }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Whether this deployment has a realtime endpoint.
    pub fn realtime_enabled(&self) -> bool {
        self.live.is_some()
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Fetch the records of `resource` matching `filter`.
    pub async fn list(
        &self,
        resource: &str,
        filter: Value,
        fields: &[&str],
    ) -> Result<RecordPage, Error> {
        let filter = if filter.is_null() { json!({}) } else { filter };
        let request =
            GraphqlRequest::new(list_document(resource, fields)).variable("filter", filter);

        let data: Value = self.gateway.execute_data(&request).await?;
        let page = data.get(resource).cloned().unwrap_or(Value::Null);

        serde_json::from_value(page).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: data.to_string(),
        })
    }

    /// Create, update, or delete one record of `resource`.
    ///
    /// `id` is required for updates and deletes. See [`MutationMode`] for
    /// the optimistic contract.
    pub async fn mutate(
        &self,
        resource: &str,
        action: MutationAction,
        id: Option<&str>,
        payload: Value,
        fields: &[&str],
        mode: MutationMode,
    ) -> Result<Value, Error> {
        let input = mutation_input(resource, action, id, &payload)?;
        let (field, document) = mutation_document(resource, action, fields);
        let request = GraphqlRequest::new(document).variable("input", input);

        match mode {
            MutationMode::Pessimistic => {
                let data: Value = self.gateway.execute_data(&request).await?;
                Ok(data.get(&field).cloned().unwrap_or(Value::Null))
            }
            MutationMode::Optimistic => {
                let gateway = Arc::clone(&self.gateway);
                let resource = resource.to_owned();
                tokio::spawn(async move {
                    if let Err(e) = gateway.execute(&request).await {
                        tracing::warn!(
                            error = %e,
                            resource,
                            "optimistic mutation failed after local success was reported"
                        );
                    }
                });
                Ok(record_echo(id, payload))
            }
        }
    }

    /// Raw passthrough for operations not modeled as resource CRUD.
    ///
    /// Returns the envelope's `data` field; protocol failures surface as
    /// [`Error::Graphql`] exactly as `list`/`mutate` raise them.
    pub async fn custom(
        &self,
        query: &str,
        variables: Map<String, Value>,
        headers: HashMap<String, String>,
    ) -> Result<Value, Error> {
        let request = GraphqlRequest {
            query: query.to_owned(),
            variables,
            headers,
        };
        let envelope = self.gateway.execute(&request).await?;
        Ok(envelope.data.unwrap_or(Value::Null))
    }

    /// Stream published events for a subscription operation, or `None`
    /// when no realtime endpoint is configured.
    pub fn subscribe(&self, request: GraphqlRequest) -> Option<SubscriptionStream> {
        self.live.as_ref().map(|channel| channel.subscribe(request))
    }
}

// ── Document builders ────────────────────────────────────────────────

/// `companies` -> `Company`, `taskStages` -> `TaskStage`.
fn singular_type(resource: &str) -> String {
    let singular = if let Some(stem) = resource.strip_suffix("ies") {
        format!("{stem}y")
    } else if let Some(stem) = resource.strip_suffix('s') {
        stem.to_owned()
    } else {
        resource.to_owned()
    };
    capitalize(&singular)
}

/// `companies` -> `company`: the key the create input nests the record
/// under.
fn singular_field(resource: &str) -> String {
    let type_name = singular_type(resource);
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => type_name,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn list_document(resource: &str, fields: &[&str]) -> String {
    let type_name = singular_type(resource);
    let selection = fields.join(" ");
    format!(
        "query {op}List($filter: {type_name}Filter!) {{ {resource}(filter: $filter) {{ nodes {{ {selection} }} totalCount }} }}",
        op = capitalize(resource),
    )
}

/// Returns the mutation field name (`createOneCompany`, ...) and the full
/// document.
fn mutation_document(resource: &str, action: MutationAction, fields: &[&str]) -> (String, String) {
    let type_name = singular_type(resource);
    let (verb, op) = match action {
        MutationAction::Create => ("createOne", "Create"),
        MutationAction::Update => ("updateOne", "Update"),
        MutationAction::Delete => ("deleteOne", "Delete"),
    };
    let field = format!("{verb}{type_name}");
    let selection = fields.join(" ");
    let document = format!(
        "mutation {op}{type_name}($input: {input_type}Input!) {{ {field}(input: $input) {{ {selection} }} }}",
        input_type = capitalize(&field),
    );
    (field, document)
}

fn mutation_input(
    resource: &str,
    action: MutationAction,
    id: Option<&str>,
    payload: &Value,
) -> Result<Value, Error> {
    match action {
        MutationAction::Create => Ok(json!({ singular_field(resource): payload })),
        MutationAction::Update => {
            let id = id.ok_or(Error::UnsupportedOperation("update requires a record id"))?;
            Ok(json!({ "id": id, "update": payload }))
        }
        MutationAction::Delete => {
            let id = id.ok_or(Error::UnsupportedOperation("delete requires a record id"))?;
            Ok(json!({ "id": id }))
        }
    }
}

/// The record reported back for an optimistic mutation: the submitted
/// payload with the target id folded in.
fn record_echo(id: Option<&str>, payload: Value) -> Value {
    let mut echo = if payload.is_null() { json!({}) } else { payload };
    if let (Some(obj), Some(id)) = (echo.as_object_mut(), id) {
        obj.entry("id")
            .or_insert_with(|| Value::String(id.to_owned()));
    }
    echo
}
