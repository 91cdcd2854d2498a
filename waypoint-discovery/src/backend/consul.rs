//! Consul agent HTTP client

use super::{HealthQuery, HealthStatus, QueryResult, Registration, RegistryBackend, ServiceEntry};
use crate::error::{DiscoveryError, Result};
use crate::node::Protocol;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Header carrying the blocking-query index.
const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul service registry client
pub struct ConsulBackend {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ConsulBackend {
    /// Create new Consul client
    ///
    /// `request_timeout` bounds plain requests; blocking health queries get
    /// their wait time added on top.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use waypoint_discovery::backend::consul::ConsulBackend;
    ///
    /// let consul = ConsulBackend::new("http://localhost:8500", Duration::from_secs(5))?;
    /// ```
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node", default)]
    node: Option<AgentNode>,
    #[serde(rename = "Service")]
    service: AgentService,
    #[serde(rename = "Checks", default)]
    checks: Vec<AgentCheck>,
}

#[derive(Deserialize)]
struct AgentNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
    #[serde(rename = "Namespace", default)]
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct AgentCheck {
    #[serde(rename = "Status")]
    status: String,
}

impl From<HealthEntry> for ServiceEntry {
    fn from(entry: HealthEntry) -> Self {
        let status = HealthStatus::aggregate(
            entry
                .checks
                .iter()
                .map(|check| HealthStatus::parse(&check.status)),
        );

        // An empty service address means "use the agent's node address".
        let address = match entry.node {
            Some(node) if entry.service.address.is_empty() => node.address,
            _ => entry.service.address,
        };

        ServiceEntry {
            id: entry.service.id,
            service: entry.service.service,
            namespace: entry.service.namespace.unwrap_or_default(),
            address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
            meta: entry.service.meta.unwrap_or_default(),
            status,
        }
    }
}

/// Go-style duration string, as the agent API expects.
fn go_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

fn registration_payload(registration: &Registration) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "ID": registration.id,
        "Name": registration.name,
        "Address": registration.address,
        "Port": registration.port,
        "Tags": registration.tags,
        "Meta": registration.meta,
    });

    if !registration.namespace.is_empty() {
        payload["Namespace"] = serde_json::json!(registration.namespace);
    }

    if let Some(check) = &registration.check {
        let kind = match check.protocol {
            Protocol::Http => "HTTP",
            Protocol::Grpc => "GRPC",
        };
        payload["Check"] = serde_json::json!({
            "Interval": go_duration(check.interval),
            "Timeout": go_duration(check.timeout),
        });
        payload["Check"][kind] = serde_json::json!(check.target);
    }

    payload
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    format!("{status}: {body}")
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let payload = registration_payload(registration);

        let response = self
            .client
            .put(&url)
            .json(&payload)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            info!(id = %registration.id, "Registered service with Consul");
            Ok(())
        } else {
            Err(DiscoveryError::RegistrationFailed(error_body(response).await))
        }
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, service_id
        );

        let response = self
            .client
            .put(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(id = service_id, "Deregistered service from Consul");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(id = service_id, "Service already absent from Consul");
                Ok(())
            }
            _ => Err(DiscoveryError::DeregistrationFailed(
                error_body(response).await,
            )),
        }
    }

    async fn health_service(&self, query: &HealthQuery) -> Result<QueryResult> {
        let url = format!("{}/v1/health/service/{}", self.base_url, query.service);

        let mut params: Vec<(&str, String)> = vec![
            ("index", query.wait_index.to_string()),
            ("wait", go_duration(query.wait)),
        ];
        if !query.tag.is_empty() {
            params.push(("tag", query.tag.clone()));
        }
        if !query.namespace.is_empty() {
            params.push(("ns", query.namespace.clone()));
        }

        // The agent may hold the request for up to wait + wait/16.
        let deadline = query.wait + query.wait / 16 + Duration::from_secs(5);

        let response = self
            .client
            .get(&url)
            .query(&params)
            .timeout(deadline)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Backend(error_body(response).await));
        }

        let last_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::MalformedPayload(e.to_string()))?;

        let entries: Vec<ServiceEntry> = entries.into_iter().map(ServiceEntry::from).collect();

        debug!(
            service = %query.service,
            count = entries.len(),
            last_index,
            "Health query returned"
        );

        Ok(QueryResult {
            entries,
            last_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterNode;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> ConsulBackend {
        ConsulBackend::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    fn query(index: u64) -> HealthQuery {
        HealthQuery {
            service: "api".into(),
            tag: String::new(),
            namespace: String::new(),
            wait_index: index,
            wait: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_registration_payload() {
        let mut node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001)
            .with_protocol(Protocol::Grpc)
            .with_health_check("10.0.0.5:5001")
            .with_tag("v1");
        node.namespace = "prod".into();

        let payload = registration_payload(&Registration::from(&node));
        assert_eq!(payload["ID"], "api-1");
        assert_eq!(payload["Namespace"], "prod");
        assert_eq!(payload["Meta"]["protocol"], "grpc");
        assert_eq!(payload["Check"]["GRPC"], "10.0.0.5:5001");
        assert_eq!(payload["Check"]["Interval"], "10s");
        assert_eq!(payload["Check"]["Timeout"], "5s");
        assert!(payload["Check"].get("HTTP").is_none());
    }

    #[test]
    fn test_payload_without_namespace_or_check() {
        let node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001);
        let payload = registration_payload(&Registration::from(&node));
        assert!(payload.get("Namespace").is_none());
        assert!(payload.get("Check").is_none());
    }

    #[tokio::test]
    async fn test_register() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .and(body_partial_json(json!({"ID": "api-1", "Name": "api", "Port": 5001})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001);
        backend(&server)
            .register(&Registration::from(&node))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid check"))
            .mount(&server)
            .await;

        let node = RegisterNode::new("api-1", "api", "10.0.0.5", 5001);
        let err = backend(&server)
            .register(&Registration::from(&node))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::RegistrationFailed(msg) if msg.contains("Invalid check")));
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        backend(&server).deregister("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_health_service_snapshot() {
        let server = MockServer::start().await;
        let body = json!([
            {
                "Node": {"Address": "192.168.1.10"},
                "Service": {
                    "ID": "api-1", "Service": "api", "Address": "10.0.0.5", "Port": 5001,
                    "Tags": ["v1"], "Meta": {"protocol": "grpc"}
                },
                "Checks": [{"Status": "passing"}, {"Status": "passing"}]
            },
            {
                "Node": {"Address": "192.168.1.11"},
                "Service": {"ID": "api-2", "Service": "api", "Address": "", "Port": 5002},
                "Checks": [{"Status": "passing"}, {"Status": "critical"}]
            }
        ]);

        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .and(query_param("index", "7"))
            .and(query_param("wait", "1s"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INDEX_HEADER, "42")
                    .set_body_json(body),
            )
            .mount(&server)
            .await;

        let result = backend(&server).health_service(&query(7)).await.unwrap();
        assert_eq!(result.last_index, 42);
        assert_eq!(result.entries.len(), 2);

        let first = &result.entries[0];
        assert_eq!(first.status, HealthStatus::Passing);
        assert_eq!(first.to_node(3).url(), "grpc://10.0.0.5:5001");

        let second = &result.entries[1];
        assert_eq!(second.status, HealthStatus::Critical);
        assert_eq!(second.address, "192.168.1.11");
        assert!(second.tags.is_empty());
    }

    #[tokio::test]
    async fn test_health_service_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .and(query_param("tag", "v2"))
            .and(query_param("ns", "prod"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INDEX_HEADER, "3")
                    .set_body_json(json!([])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut query = query(0);
        query.tag = "v2".into();
        query.namespace = "prod".into();

        let result = backend(&server).health_service(&query).await.unwrap();
        assert!(result.entries.is_empty());
        assert_eq!(result.last_index, 3);
    }

    #[tokio::test]
    async fn test_health_service_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/api"))
            .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
            .mount(&server)
            .await;

        let err = backend(&server).health_service(&query(0)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Backend(_)));
        assert!(err.is_retryable());
    }
}
