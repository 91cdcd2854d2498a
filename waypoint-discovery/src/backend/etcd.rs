//! etcd v3 client over the JSON gateway
//!
//! Keys and values travel base64-encoded; int64 fields may arrive as JSON
//! strings. Streaming RPCs (`watch`, `keepalive`) answer with one JSON frame
//! per line.

use super::{KeyValue, KvBackend, KvEvent, RangeResult, WatchStream, prefix_range_end};
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Deserializer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// etcd gateway client with endpoint failover
pub struct EtcdBackend {
    endpoints: Vec<String>,
    current: AtomicUsize,
    client: reqwest::Client,
    /// No overall timeout: watches stay open indefinitely
    watch_client: reqwest::Client,
}

impl EtcdBackend {
    /// Create new etcd client
    ///
    /// Requests go to the first endpoint until a connect or timeout error,
    /// then move on to the next one.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use waypoint_discovery::backend::etcd::EtcdBackend;
    ///
    /// let etcd = EtcdBackend::new(vec!["http://localhost:2379".into()], Duration::from_secs(5))?;
    /// ```
    pub fn new(endpoints: Vec<String>, dial_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(DiscoveryError::InvalidConfiguration(
                "etcd requires at least one endpoint".to_string(),
            ));
        }

        let endpoints = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(dial_timeout)
            .build()?;
        let watch_client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()?;

        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            client,
            watch_client,
        })
    }

    /// Endpoint requests currently go to
    pub fn endpoint(&self) -> &str {
        let index = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }

    fn rotate(&self, error: &reqwest::Error) {
        if self.endpoints.len() > 1 && (error.is_connect() || error.is_timeout()) {
            let previous = self.current.fetch_add(1, Ordering::Relaxed);
            warn!(
                failed = %self.endpoints[previous % self.endpoints.len()],
                next = %self.endpoint(),
                "etcd endpoint unreachable, failing over"
            );
        }
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.endpoint(), path);
        match client.post(&url).json(body).send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.rotate(&e);
                Err(e.into())
            }
        }
    }

    /// POST and fail on a non-success status.
    async fn call(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self.post(&self.client, path, body).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DiscoveryError::Backend(error_body(response).await))
        }
    }
}

fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| DiscoveryError::MalformedPayload(format!("{field}: {e}")))
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    format!("{status}: {body}")
}

fn is_lease_not_found(message: &str) -> bool {
    message.contains("lease not found")
}

/// int64 fields are strings in the gateway's JSON mapping; accept both.
fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(i64),
        Str(String),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Repr::Num(n)) => Ok(n),
        Some(Repr::Str(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize, Default)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "lenient_i64")]
    revision: i64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "lenient_i64")]
    id: i64,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResponse {
    #[serde(rename = "TTL", default, deserialize_with = "lenient_i64")]
    ttl: i64,
}

#[derive(Deserialize, Default)]
struct RawKv {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    lease: i64,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    kvs: Vec<RawKv>,
}

#[derive(Deserialize)]
struct WatchResponse {
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    /// Absent for PUT, the enum's zero value
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    kv: RawKv,
}

/// One line of a streaming response.
#[derive(Deserialize)]
struct StreamFrame<T> {
    result: Option<T>,
    error: Option<GatewayError>,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

impl RawKv {
    fn decode(self) -> Result<KeyValue> {
        let key = decode("key", &self.key)?;
        Ok(KeyValue {
            key: String::from_utf8_lossy(&key).into_owned(),
            value: decode("value", &self.value)?,
            lease: self.lease,
        })
    }
}

impl RawEvent {
    fn decode(self) -> Result<KvEvent> {
        let kv = self.kv.decode()?;
        if self.kind == "DELETE" {
            Ok(KvEvent::Delete { key: kv.key })
        } else {
            Ok(KvEvent::Put(kv))
        }
    }
}

/// Decode one watch frame. Frames without events (creation acks, progress
/// notifications) decode to an empty batch.
fn decode_watch_line(line: &[u8]) -> Result<Vec<KvEvent>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let frame: StreamFrame<WatchResponse> = serde_json::from_slice(line)
        .map_err(|e| DiscoveryError::MalformedPayload(format!("watch frame: {e}")))?;

    if let Some(error) = frame.error {
        return Err(DiscoveryError::Backend(error.message));
    }
    let Some(result) = frame.result else {
        return Ok(Vec::new());
    };
    if result.canceled {
        return Err(DiscoveryError::Backend(format!(
            "watch canceled: {}",
            result.cancel_reason
        )));
    }

    result.events.into_iter().map(RawEvent::decode).collect()
}

/// Split a chunked body into newline-delimited frames and decode each one.
fn watch_events<S, B>(bytes: S) -> WatchStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match decode_watch_line(&line) {
                        Ok(events) if events.is_empty() => continue,
                        item => return Some((item, (bytes, buf, done))),
                    }
                }

                if done {
                    let line = std::mem::take(&mut buf);
                    return match decode_watch_line(&line) {
                        Ok(events) if events.is_empty() => None,
                        item => Some((item, (bytes, buf, done))),
                    };
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(e.into()), (bytes, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn lease_grant(&self, ttl_secs: i64) -> Result<i64> {
        let body = serde_json::json!({ "TTL": ttl_secs, "ID": 0 });
        let response: LeaseGrantResponse = self
            .call("/v3/lease/grant", &body)
            .await?
            .json()
            .await
            .map_err(|e| DiscoveryError::MalformedPayload(e.to_string()))?;

        if !response.error.is_empty() {
            return Err(DiscoveryError::Backend(response.error));
        }
        if response.id == 0 {
            return Err(DiscoveryError::MalformedPayload(
                "lease grant returned no ID".to_string(),
            ));
        }

        debug!(lease = response.id, ttl = ttl_secs, "Granted lease");
        Ok(response.id)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<()> {
        let body = serde_json::json!({ "ID": lease });
        let text = self.call("/v3/lease/keepalive", &body).await?.text().await?;

        let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let frame: StreamFrame<LeaseKeepAliveResponse> = serde_json::from_str(line)
            .map_err(|e| DiscoveryError::MalformedPayload(format!("keepalive: {e}")))?;

        if let Some(error) = frame.error {
            return if is_lease_not_found(&error.message) {
                Err(DiscoveryError::LeaseNotFound(lease))
            } else {
                Err(DiscoveryError::Backend(error.message))
            };
        }

        // The server answers an unknown lease with a zero TTL.
        match frame.result {
            Some(result) if result.ttl > 0 => Ok(()),
            _ => Err(DiscoveryError::LeaseNotFound(lease)),
        }
    }

    async fn lease_revoke(&self, lease: i64) -> Result<()> {
        let body = serde_json::json!({ "ID": lease });
        match self.call("/v3/lease/revoke", &body).await {
            Ok(_) => {
                info!(lease, "Revoked lease");
                Ok(())
            }
            Err(DiscoveryError::Backend(message)) if is_lease_not_found(&message) => {
                debug!(lease, "Lease already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, value: &[u8], lease: i64) -> Result<()> {
        let body = serde_json::json!({
            "key": encode(key.as_bytes()),
            "value": encode(value),
            "lease": lease,
        });

        match self.call("/v3/kv/put", &body).await {
            Ok(_) => Ok(()),
            Err(DiscoveryError::Backend(message)) if is_lease_not_found(&message) => {
                Err(DiscoveryError::LeaseNotFound(lease))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let body = serde_json::json!({ "key": encode(key.as_bytes()) });
        self.call("/v3/kv/deleterange", &body).await?;
        Ok(())
    }

    async fn range(&self, prefix: &str) -> Result<RangeResult> {
        let body = serde_json::json!({
            "key": encode(prefix.as_bytes()),
            "range_end": encode(&prefix_range_end(prefix.as_bytes())),
        });

        let response: RangeResponse = self
            .call("/v3/kv/range", &body)
            .await?
            .json()
            .await
            .map_err(|e| DiscoveryError::MalformedPayload(e.to_string()))?;

        let kvs = response
            .kvs
            .into_iter()
            .map(RawKv::decode)
            .collect::<Result<Vec<_>>>()?;

        debug!(prefix, count = kvs.len(), revision = response.header.revision, "Range read");
        Ok(RangeResult {
            kvs,
            revision: response.header.revision,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let body = serde_json::json!({
            "create_request": {
                "key": encode(prefix.as_bytes()),
                "range_end": encode(&prefix_range_end(prefix.as_bytes())),
                "start_revision": start_revision,
            }
        });

        let response = self.post(&self.watch_client, "/v3/watch", &body).await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Backend(error_body(response).await));
        }

        debug!(prefix, start_revision, "Watch established");
        Ok(watch_events(response.bytes_stream().boxed()))
    }
}
