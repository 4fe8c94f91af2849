//! Remote actor client
//!
//! Every collaborator is reached the same way: pick one of the configured
//! hosts for its role uniformly at random and `POST {host}/{role}/{mode}` a
//! JSON body. The reply is classified before anyone looks at it:
//!
//! ```text
//! 409                              → Conflict
//! body contains "error" (any case) → Upstream, with the structured errors
//! other non-2xx                    → Upstream
//! otherwise                        → Ok(json)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Concept,
    Target,
    Data,
    Aggregator,
    Conductor,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Concept,
        Role::Target,
        Role::Data,
        Role::Aggregator,
        Role::Conductor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Concept => "concept",
            Role::Target => "target",
            Role::Data => "data",
            Role::Aggregator => "aggregator",
            Role::Conductor => "conductor",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Role::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RemoteError {
    #[error("no hosts configured for role {0}")]
    NoHosts(Role),

    #[error("transport error calling {url}: {message}")]
    Transport { url: String, message: String },

    #[error("conflict reported by remote: {0}")]
    Conflict(String),

    #[error("remote failure (status {status}): {}", errors.join("; "))]
    Upstream { status: u16, errors: Vec<String> },

    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait RemoteActor: Send + Sync {
    async fn call(
        &self,
        role: Role,
        mode: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError>;
}

/// Typed wrapper over [`RemoteActor::call`].
pub async fn call_json<Req, Resp>(
    remote: &dyn RemoteActor,
    role: Role,
    mode: &str,
    request: &Req,
) -> Result<Resp, RemoteError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let body =
        serde_json::to_value(request).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    let reply = remote.call(role, mode, body).await?;
    serde_json::from_value(reply).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Clone)]
pub struct HttpRemoteActor {
    http: reqwest::Client,
    hosts: HashMap<Role, Vec<String>>,
}

impl HttpRemoteActor {
    pub fn new(hosts: HashMap<Role, Vec<String>>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        let hosts = hosts
            .into_iter()
            .map(|(role, list)| {
                let list = list
                    .into_iter()
                    .map(|h| h.trim_end_matches('/').to_string())
                    .filter(|h| !h.is_empty())
                    .collect();
                (role, list)
            })
            .collect();
        Ok(Self { http, hosts })
    }

    fn pick_host(&self, role: Role) -> Result<&str, RemoteError> {
        let hosts = self.hosts.get(&role).map(Vec::as_slice).unwrap_or_default();
        hosts
            .choose(&mut rand::rng())
            .map(String::as_str)
            .ok_or(RemoteError::NoHosts(role))
    }
}

#[async_trait]
impl RemoteActor for HttpRemoteActor {
    async fn call(
        &self,
        role: Role,
        mode: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteError> {
        let url = format!("{}/{}/{}", self.pick_host(role)?, role, mode);
        tracing::debug!(%role, mode, %url, "Calling remote actor");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteError::Transport {
                url: url.clone(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| RemoteError::Transport {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let classified = classify_response(status, &text);
        if let Err(error) = &classified {
            tracing::warn!(%role, mode, %url, status, error = %error, "Remote actor call failed");
        }
        classified
    }
}

/// Classify a raw reply. Pure so it can be tested without a server.
pub fn classify_response(status: u16, body: &str) -> Result<serde_json::Value, RemoteError> {
    if status == 409 {
        return Err(RemoteError::Conflict(body.to_string()));
    }
    if body.to_ascii_lowercase().contains("error") {
        return Err(RemoteError::Upstream {
            status,
            errors: extract_errors(body),
        });
    }
    if !(200..300).contains(&status) {
        return Err(RemoteError::Upstream {
            status,
            errors: vec![body.to_string()],
        });
    }
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

fn describe(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn extract_errors(body: &str) -> Vec<String> {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let structured = parsed.as_ref().and_then(|json| {
        if let Some(list) = json.get("errors").and_then(|e| e.as_array()) {
            return Some(list.iter().map(describe).collect::<Vec<_>>());
        }
        json.get("error").map(|e| vec![describe(e)])
    });
    match structured {
        Some(errors) if !errors.is_empty() => errors,
        _ => vec![body.to_string()],
    }
}
