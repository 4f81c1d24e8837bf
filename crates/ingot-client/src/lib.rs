//! Client for the central provisioning service.
//!
//! Two calls matter: the driver-scoped lookup that turns a freshly booted
//! host into a known node (retried with exponential backoff until a
//! deadline), and the node-scoped heartbeat that keeps the node alive in the
//! central service. Transient lookup failures are logged and retried here;
//! heartbeat failures surface to the heartbeater, which owns the backoff.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use ingot_proto::HardwareInventory;

const API_VERSION: &str = "v1";

/// Version of the lookup payload schema, not of the agent.
const PAYLOAD_VERSION: &str = "2";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("error heartbeating to the provisioning service: {0}")]
    Heartbeat(String),

    #[error("could not look up node info before the lookup deadline")]
    LookupNode,

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Parsed body of a successful lookup. `node` stays an unstructured mapping;
/// callers extract what they need.
#[derive(Debug, Clone)]
pub struct LookupContent {
    pub node: Value,
    pub heartbeat_timeout: f64,
    pub config: Option<Value>,
}

/// The heartbeat seam, separated so the heartbeater can be driven by a stub
/// in tests.
#[async_trait]
pub trait HeartbeatApi: Send + Sync {
    async fn heartbeat(&self, node_uuid: &str, agent_url: &str) -> Result<f64, ApiError>;
}

pub struct ApiClient {
    http: reqwest::Client,
    api_url: String,
    driver_name: String,
}

impl ApiClient {
    pub fn new(api_url: &str, driver_name: &str) -> Result<Self, ApiError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            driver_name: driver_name.to_string(),
        })
    }

    /// Look the node up by inventory, retrying transient failures with
    /// exponential backoff until `timeout` elapses.
    pub async fn lookup_node(
        &self,
        inventory: &HardwareInventory,
        timeout: Duration,
        starting_interval: Duration,
    ) -> Result<LookupContent, ApiError> {
        let deadline = Instant::now() + timeout;
        let mut interval = starting_interval;
        loop {
            if let Some(content) = self.try_lookup(inventory).await {
                info!(
                    heartbeat_timeout = content.heartbeat_timeout,
                    "node lookup succeeded"
                );
                return Ok(content);
            }
            if Instant::now() + interval >= deadline {
                return Err(ApiError::LookupNode);
            }
            tokio::time::sleep(interval).await;
            interval = interval.saturating_mul(2);
        }
    }

    /// One lookup attempt. Every failure mode is transient from the caller's
    /// point of view, so this only reports success or "try again".
    async fn try_lookup(&self, inventory: &HardwareInventory) -> Option<LookupContent> {
        let url = format!(
            "{}/{}/drivers/{}/vendor_passthru/lookup",
            self.api_url, API_VERSION, self.driver_name
        );
        let payload = json!({
            "version": PAYLOAD_VERSION,
            "inventory": inventory,
        });

        let response = match self.http.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "lookup POST failed");
                return None;
            }
        };

        if response.status() != StatusCode::ACCEPTED {
            warn!(status = %response.status(), "invalid lookup status code");
            return None;
        }

        let content: Value = match response.json().await {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "error decoding lookup response");
                return None;
            }
        };

        parse_lookup_content(content)
    }

    /// Heartbeat the node. Success is exactly "204 plus a parseable
    /// `Heartbeat-Before` header"; the returned value is the service's
    /// seconds-until-next-heartbeat hint.
    pub async fn heartbeat(&self, node_uuid: &str, agent_url: &str) -> Result<f64, ApiError> {
        let url = format!(
            "{}/{}/nodes/{}/vendor_passthru/heartbeat",
            self.api_url, API_VERSION, node_uuid
        );
        let payload = json!({ "agent_url": agent_url });

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ApiError::Heartbeat(err.to_string()))?;

        if response.status() != StatusCode::NO_CONTENT {
            return Err(ApiError::Heartbeat(format!(
                "invalid status code: {}",
                response.status()
            )));
        }

        response
            .headers()
            .get("Heartbeat-Before")
            .ok_or_else(|| ApiError::Heartbeat("missing Heartbeat-Before header".to_string()))?
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .ok_or_else(|| ApiError::Heartbeat("invalid Heartbeat-Before header".to_string()))
    }
}

#[async_trait]
impl HeartbeatApi for ApiClient {
    async fn heartbeat(&self, node_uuid: &str, agent_url: &str) -> Result<f64, ApiError> {
        ApiClient::heartbeat(self, node_uuid, agent_url).await
    }
}

/// Validate the lookup body: `node.uuid` and `heartbeat_timeout` are
/// required, everything else rides along untouched.
fn parse_lookup_content(content: Value) -> Option<LookupContent> {
    let node = content.get("node")?;
    if node.get("uuid").and_then(Value::as_str).is_none() {
        warn!(%content, "lookup response is missing node.uuid");
        return None;
    }
    let Some(heartbeat_timeout) = content.get("heartbeat_timeout").and_then(Value::as_f64) else {
        warn!(%content, "lookup response is missing heartbeat_timeout");
        return None;
    };
    Some(LookupContent {
        node: node.clone(),
        heartbeat_timeout,
        config: content.get("config").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use ingot_proto::{Cpu, Memory};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct StubState {
        lookups: Arc<Mutex<Vec<Value>>>,
        failures_before_accept: Arc<Mutex<u32>>,
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn inventory() -> HardwareInventory {
        HardwareInventory {
            interfaces: Vec::new(),
            cpu: Cpu {
                model_name: None,
                frequency: None,
                count: 1,
            },
            disks: Vec::new(),
            memory: Memory { total: 1024 },
        }
    }

    fn lookup_router(state: StubState) -> Router {
        Router::new()
            .route(
                "/v1/drivers/:driver/vendor_passthru/lookup",
                post(
                    |State(state): State<StubState>, Json(body): Json<Value>| async move {
                        state.lookups.lock().push(body);
                        let mut failures = state.failures_before_accept.lock();
                        if *failures > 0 {
                            *failures -= 1;
                            return (StatusCode::CONFLICT, Json(json!({})));
                        }
                        (
                            StatusCode::ACCEPTED,
                            Json(json!({
                                "node": { "uuid": "deadbeef-dabb-ad00-b105-f00d00bab10c" },
                                "heartbeat_timeout": 300.0,
                            })),
                        )
                    },
                ),
            )
            .with_state(state)
    }

    #[tokio::test]
    async fn test_lookup_posts_versioned_inventory() {
        let state = StubState::default();
        let addr = serve(lookup_router(state.clone())).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let content = client
            .lookup_node(
                &inventory(),
                Duration::from_secs(5),
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        assert_eq!(
            content.node["uuid"],
            "deadbeef-dabb-ad00-b105-f00d00bab10c"
        );
        assert_eq!(content.heartbeat_timeout, 300.0);

        let lookups = state.lookups.lock();
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0]["version"], "2");
        assert_eq!(lookups[0]["inventory"]["memory"]["total"], 1024);
    }

    #[tokio::test]
    async fn test_lookup_retries_transient_failures() {
        let state = StubState::default();
        *state.failures_before_accept.lock() = 2;
        let addr = serve(lookup_router(state.clone())).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let content = client
            .lookup_node(
                &inventory(),
                Duration::from_secs(5),
                Duration::from_millis(5),
            )
            .await
            .unwrap();

        assert_eq!(content.heartbeat_timeout, 300.0);
        assert_eq!(state.lookups.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_lookup_times_out() {
        let router = Router::new().route(
            "/v1/drivers/:driver/vendor_passthru/lookup",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let addr = serve(router).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let result = client
            .lookup_node(
                &inventory(),
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(ApiError::LookupNode)));
    }

    #[tokio::test]
    async fn test_lookup_rejects_body_without_uuid() {
        let router = Router::new().route(
            "/v1/drivers/:driver/vendor_passthru/lookup",
            post(|| async {
                (
                    StatusCode::ACCEPTED,
                    Json(json!({ "node": {}, "heartbeat_timeout": 300.0 })),
                )
            }),
        );
        let addr = serve(router).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let result = client
            .lookup_node(
                &inventory(),
                Duration::from_millis(40),
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(ApiError::LookupNode)));
    }

    #[tokio::test]
    async fn test_heartbeat_returns_deadline_hint() {
        let heartbeats: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = heartbeats.clone();
        let router = Router::new().route(
            "/v1/nodes/:uuid/vendor_passthru/heartbeat",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(body);
                    (StatusCode::NO_CONTENT, [("Heartbeat-Before", "300.0")])
                }
            }),
        );
        let addr = serve(router).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let next = client
            .heartbeat("deadbeef", "http://192.0.2.1:9999")
            .await
            .unwrap();
        assert_eq!(next, 300.0);
        assert_eq!(heartbeats.lock()[0]["agent_url"], "http://192.0.2.1:9999");
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_wrong_status() {
        let router = Router::new().route(
            "/v1/nodes/:uuid/vendor_passthru/heartbeat",
            post(|| async { StatusCode::OK }),
        );
        let addr = serve(router).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let result = client.heartbeat("deadbeef", "http://192.0.2.1:9999").await;
        assert!(matches!(result, Err(ApiError::Heartbeat(ref m)) if m.contains("status")));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_parseable_header() {
        let router = Router::new().route(
            "/v1/nodes/:uuid/vendor_passthru/heartbeat",
            post(|| async { StatusCode::NO_CONTENT }),
        );
        let addr = serve(router).await;
        let client = ApiClient::new(&format!("http://{addr}"), "agent_ipmitool").unwrap();

        let result = client.heartbeat("deadbeef", "http://192.0.2.1:9999").await;
        assert!(matches!(result, Err(ApiError::Heartbeat(ref m)) if m.contains("Heartbeat-Before")));
    }
}
