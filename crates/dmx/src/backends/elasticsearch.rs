//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! *Previously, on dmx...*
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 6:04 AM
//!
//! The rates file has been parsed. The documents are ready. One minute to go.
//! Somewhere, a cluster is still deciding whether the index it created four seconds ago
//! actually exists. "Eventually consistent," someone says, in the tone people use for
//! "it's complicated."
//!
//! 🚀 This module speaks HTTP to an Elasticsearch-compatible cluster on behalf of the
//! bootstrapper and the writer: existence checks, index creation, readiness probes,
//! mappings, and `_bulk` upserts with per-item outcomes.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

mod bulk;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::backends::Store;
use crate::common::{BulkOperation, WriteOutcome};
use crate::errors::{PipelineError, StoreError};

// 🚰 "What's the DEAL with index names?" — Jerry Seinfeld, if he were a DevOps engineer.
// Connection, index layout and write knobs, all in the one `[store]` block.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchStoreConfig {
    /// 📡 Full base URL, scheme and port included. Wins over `host`/`port`.
    #[serde(default)]
    pub url: Option<String>,
    /// 📡 Host name, for configs that only know host and port.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 🔒 Username. The bouncer at the club. Except the club is a database.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key — the velvet rope variant of authentication. Beats basic auth.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 📦 The one index every document of this run lands in.
    pub index: String,
    #[serde(default = "default_one")]
    pub number_of_shards: u32,
    #[serde(default = "default_one")]
    pub number_of_replicas: u32,
    /// 📦 Operations per bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    /// ⏱️ How long a single bulk flush may take before the whole batch counts as failed.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// ⚔️ Store-side retries per item when another writer got there first.
    #[serde(default = "default_retry_on_conflict")]
    pub retry_on_conflict: u32,
    /// 🦖 Old clusters with mapping types: `_type` in bulk actions, typed mapping endpoint.
    #[serde(default)]
    pub legacy_types: bool,
}

fn default_port() -> u16 {
    9200
}

fn default_one() -> u32 {
    1
}

// 📦 500 ops ≈ a few hundred KB of NDJSON for rate documents. Polite to any cluster.
fn default_bulk_size() -> usize {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

// ⚔️ 100: enough for a handful of loaders hammering the same date, not enough to hide a livelock
fn default_retry_on_conflict() -> u32 {
    100
}

impl ElasticsearchStoreConfig {
    /// 📡 Resolve the base URL from `url`, or from `host` + `port`.
    pub fn base_url(&self) -> Result<String, PipelineError> {
        match (&self.url, &self.host) {
            (Some(url), _) => Ok(url.trim_end_matches('/').to_string()),
            (None, Some(host)) if host.contains("://") => {
                Ok(format!("{}:{}", host.trim_end_matches('/'), self.port))
            }
            (None, Some(host)) => Ok(format!("http://{}:{}", host, self.port)),
            (None, None) => Err(PipelineError::Config(
                "store needs either `url` or `host` (+ `port`)".to_string(),
            )),
        }
    }
}

/// 📡 The Elasticsearch store: a reused `reqwest::Client` and a base URL.
///
/// Clone is cheap (the client is an `Arc` inside), so the bootstrapper and the writer
/// each get their own handle to the same connection pool.
#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    base_url: String,
    config: ElasticsearchStoreConfig,
}

impl ElasticsearchStore {
    /// 🚀 Build the HTTP client. No network traffic yet; `ping` does that.
    pub fn new(config: ElasticsearchStoreConfig) -> Result<Self, PipelineError> {
        let base_url = config.base_url()?;
        // 🔧 connect timeout only. Bulk flushes carry their own deadline from the writer.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| {
                PipelineError::Config(format!(
                    "the HTTP client refused to be born ({err}). Probably TLS. Either way: tragic."
                ))
            })?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 📡 "Hello? Is this thing on?" — fail loudly here rather than quietly at document 50,000.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let response = self.request(Method::GET, "").send().await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        info!("🔌 connected to the store at {}", self.base_url);
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.client.request(method, url);
        // 🔒 API key wins over basic auth. This is not a democracy.
        if let Some(ref api_key) = self.config.api_key {
            request = request.header("Authorization", format!("ApiKey {}", api_key));
        } else if let Some(ref username) = self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }
        request
    }

    fn json_request(&self, method: Method, path: &str, body: &Value) -> RequestBuilder {
        self.request(method, path)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }
}

/// 💀 Turn a non-2xx response into a `Rejected`, body included. Error bodies are poetry.
async fn rejected(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StoreError::Rejected { status, body }
}

#[async_trait]
impl Store for ElasticsearchStore {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let response = self.request(Method::HEAD, index).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejected(response).await),
        }
    }

    async fn create_index(&self, index: &str, settings: &Value) -> Result<(), StoreError> {
        debug!("🏗️ PUT /{index}");
        let response = self
            .json_request(Method::PUT, index, settings)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }

    async fn index_ready(&self, index: &str) -> Result<bool, StoreError> {
        let path = format!("_cluster/health/{index}?wait_for_status=yellow&timeout=1s");
        let response = self.request(Method::GET, &path).send().await?;
        // -- 408 is how the health API says "not yet" when the wait times out
        if response.status() == StatusCode::REQUEST_TIMEOUT {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let body = response.text().await?;
        let health: Value = serde_json::from_str(&body)
            .map_err(|err| StoreError::Decode(format!("cluster health is not JSON: {err}")))?;
        let timed_out = health
            .get("timed_out")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let status = health
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("red");
        trace!("🩺 health of {index}: {status} (timed_out: {timed_out})");
        Ok(!timed_out && status != "red")
    }

    async fn put_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: &Value,
    ) -> Result<(), StoreError> {
        let path = if self.config.legacy_types {
            format!("{index}/_mapping/{doc_type}")
        } else {
            format!("{index}/_mapping")
        };
        debug!("🗺️ PUT /{path}");
        let response = self.json_request(Method::PUT, &path, mapping).send().await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        retry_on_conflict: u32,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let body = bulk::render_bulk_body(
            operations,
            index,
            retry_on_conflict,
            self.config.legacy_types,
        );
        debug!(
            "📡 sending {} operations ({} bytes) to /{index}/_bulk",
            operations.len(),
            body.len()
        );
        let response = self
            .request(Method::POST, &format!("{index}/_bulk"))
            // ⚠️ application/x-ndjson, not application/json. VERY important.
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let text = response.text().await?;
        bulk::parse_bulk_response(&text, operations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{OpKind, OutputDocument};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ElasticsearchStoreConfig {
        ElasticsearchStoreConfig {
            url: Some(server.uri()),
            host: None,
            port: default_port(),
            username: None,
            password: None,
            api_key: None,
            index: "rates".into(),
            number_of_shards: 1,
            number_of_replicas: 0,
            bulk_size: default_bulk_size(),
            timeout_secs: default_timeout_secs(),
            retry_on_conflict: default_retry_on_conflict(),
            legacy_types: false,
        }
    }

    fn op(key: &str) -> BulkOperation {
        let mut document = OutputDocument::new(key);
        document.insert_entry("USD", "1.08");
        BulkOperation {
            kind: OpKind::MergeOrInsert,
            doc_type: "currency".into(),
            merge_key: key.into(),
            document,
        }
    }

    #[test]
    fn the_one_where_host_and_port_become_a_url() {
        let mut config = ElasticsearchStoreConfig {
            url: None,
            host: Some("es.internal".into()),
            port: 9201,
            ..config_for_static()
        };
        assert_eq!(config.base_url().expect("💀 url"), "http://es.internal:9201");

        config.url = Some("https://cluster.example:9243/".into());
        assert_eq!(
            config.base_url().expect("💀 url"),
            "https://cluster.example:9243"
        );

        config.url = None;
        config.host = None;
        assert!(config.base_url().is_err());
    }

    fn config_for_static() -> ElasticsearchStoreConfig {
        ElasticsearchStoreConfig {
            url: None,
            host: None,
            port: default_port(),
            username: None,
            password: None,
            api_key: None,
            index: "rates".into(),
            number_of_shards: 1,
            number_of_replicas: 1,
            bulk_size: default_bulk_size(),
            timeout_secs: default_timeout_secs(),
            retry_on_conflict: default_retry_on_conflict(),
            legacy_types: false,
        }
    }

    #[tokio::test]
    async fn the_one_where_head_tells_us_whether_the_index_lives() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/existing"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = ElasticsearchStore::new(config_for(&server)).expect("💀 store");
        assert!(!store.index_exists("rates").await.expect("💀 head"));
        assert!(store.index_exists("existing").await.expect("💀 head"));
    }

    #[tokio::test]
    async fn the_one_where_the_bulk_body_goes_out_as_ndjson_and_outcomes_come_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rates/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string_contains("\"retry_on_conflict\":100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 5,
                "errors": false,
                "items": [
                    { "update": { "_id": "2024-01-05", "status": 201, "result": "created" } },
                    { "update": { "_id": "2024-01-06", "status": 200, "result": "updated" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = ElasticsearchStore::new(config_for(&server)).expect("💀 store");
        let outcomes = store
            .bulk("rates", &[op("2024-01-05"), op("2024-01-06")], 100)
            .await
            .expect("💀 bulk");
        assert_eq!(outcomes, vec![WriteOutcome::Inserted, WriteOutcome::Merged]);
    }

    #[tokio::test]
    async fn the_one_where_a_rejected_bulk_keeps_its_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rates/_bulk"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
            .mount(&server)
            .await;

        let store = ElasticsearchStore::new(config_for(&server)).expect("💀 store");
        match store.bulk("rates", &[op("2024-01-05")], 100).await {
            Err(StoreError::Rejected { status, body }) => {
                assert_eq!(status, 413);
                assert_eq!(body, "too large");
            }
            other => panic!("💀 expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_health_says_yellow_is_good_enough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health/rates"))
            .and(query_param("wait_for_status", "yellow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "yellow", "timed_out": false })),
            )
            .mount(&server)
            .await;

        let store = ElasticsearchStore::new(config_for(&server)).expect("💀 store");
        assert!(store.index_ready("rates").await.expect("💀 health"));
    }

    #[tokio::test]
    async fn the_one_where_legacy_mappings_use_the_typed_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/rates/_mapping/currency"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config_for(&server);
        config.legacy_types = true;
        let store = ElasticsearchStore::new(config).expect("💀 store");
        store
            .put_mapping("rates", "currency", &json!({ "properties": {} }))
            .await
            .expect("💀 mapping");
    }

    #[tokio::test]
    async fn the_one_where_the_index_appears_between_the_check_and_the_create() {
        use crate::bootstrap::{BootstrapAction, Bootstrapper, IndexDescriptor};
        use crate::convergence::{ConvergencePolicy, Shutdown};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "type": "resource_already_exists_exception",
                    "reason": "index [rates/abc123] already exists"
                },
                "status": 400
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/rates/_mapping"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let store = ElasticsearchStore::new(config_for(&server)).expect("💀 store");
        let descriptor = IndexDescriptor::new("rates", 1, 0)
            .with_mapping("currency", json!({ "properties": {} }));
        let action = Bootstrapper::new(store, ConvergencePolicy::immediate(), Shutdown::new())
            .ensure_index(&descriptor)
            .await
            .expect("💀 a rival's index is still an index");
        assert_eq!(action, BootstrapAction::AlreadyPresent);
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_listening() {
        // -- port 9 is discard; on CI nothing listens there, which is the point
        let mut config = config_for_static();
        config.url = Some("http://127.0.0.1:9".into());
        let store = ElasticsearchStore::new(config).expect("💀 store");
        let err = store.index_exists("rates").await.unwrap_err();
        assert!(err.is_connection(), "expected a connection error, got {err:?}");
    }
}
