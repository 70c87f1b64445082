use crate::error::{Error, Result};
use crate::model::User;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;

/// Capability for resolving user ids against the identity service. The
/// aggregation service only sees this trait, so tests substitute an
/// in-memory fake.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<User>;

    /// Resolve a batch of ids concurrently. Any individual failure fails the
    /// whole call with the failing id(s); callers wanting per-id degradation
    /// fall back to individual lookups.
    async fn resolve_many(&self, ids: &[String]) -> Result<Vec<User>> {
        let results = join_all(ids.iter().map(|id| self.resolve(id))).await;
        let mut users = Vec::with_capacity(ids.len());
        let mut failed = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(user) => users.push(user),
                Err(_) => failed.push(id.clone()),
            }
        }
        if failed.is_empty() {
            Ok(users)
        } else {
            Err(Error::Upstream { ids: failed })
        }
    }
}

const USER_QUERY: &str =
    "query GetUser($id: ID!) { user(id: $id) { id username email displayName createdAt updatedAt } }";

/// HTTP client for the external user service's GraphQL endpoint.
pub struct HttpIdentityClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpIdentityClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<UserData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct UserData {
    user: Option<User>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[async_trait]
impl IdentityLookup for HttpIdentityClient {
    async fn resolve(&self, id: &str) -> Result<User> {
        let upstream = || Error::Upstream { ids: vec![id.to_string()] };
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": USER_QUERY, "variables": { "id": id } }))
            .send()
            .await
            .map_err(|_| upstream())?;
        if !resp.status().is_success() {
            return Err(upstream());
        }
        let body: GraphqlResponse = resp.json().await.map_err(|_| upstream())?;
        if let Some(user) = body.data.and_then(|d| d.user) {
            return Ok(user);
        }
        // the user service reports a missing id as a GraphQL error with a
        // null user; anything else is an upstream failure
        match body.errors.first() {
            Some(err) if err.message.to_lowercase().contains("not found") => {
                Err(Error::not_found("user", id))
            }
            Some(err) => {
                tracing::debug!(id, error = %err.message, "identity service returned an error");
                Err(upstream())
            }
            None => Err(Error::not_found("user", id)),
        }
    }
}
