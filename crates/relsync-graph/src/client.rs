use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};

use crate::{EdgeDescriptor, GraphError, GraphStore, NodeDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Server errors and 429 are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500..=599 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Doubling delay after the `retry`-th failed attempt, never above `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|shift| 2u32.checked_pow(shift))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    pub base_url: String,
    /// Legacy index the external ids are registered under.
    pub index_namespace: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl GraphClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index_namespace: "koding".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Client for the Neo4j 1.x/2.x REST endpoints under `/db/data`.
#[derive(Debug)]
pub struct Neo4jRestClient {
    client: reqwest::Client,
    base_url: String,
    index_namespace: String,
    backoff: BackoffPolicy,
}

impl Neo4jRestClient {
    pub fn new(config: GraphClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building graph http client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            index_namespace: config.index_namespace,
            backoff: config.backoff,
        })
    }

    fn node_index_url(&self, external_id: &str) -> String {
        format!(
            "{}/db/data/index/node/{}/id/{}",
            self.base_url, self.index_namespace, external_id
        )
    }

    fn relationships_url(&self, node_id: &str, rel_type: &str) -> String {
        format!(
            "{}/db/data/node/{}/relationships/all/{}",
            self.base_url, node_id, rel_type
        )
    }

    fn batch_url(&self) -> String {
        format!("{}/db/data/batch", self.base_url)
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Vec<u8>, GraphError> {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying graph request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(GraphError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying graph request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GraphError::Request(err));
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        let body = self
            .send_with_retry(
                || {
                    self.client
                        .get(url)
                        .header(reqwest::header::ACCEPT, "application/json")
                },
                url,
            )
            .instrument(info_span!("graph_get", url))
            .await?;
        serde_json::from_slice(&body).map_err(|err| GraphError::Decode {
            url: url.to_string(),
            cause: err.to_string(),
        })
    }
}

#[async_trait]
impl GraphStore for Neo4jRestClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn nodes_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Vec<NodeDescriptor>, GraphError> {
        self.get_json(&self.node_index_url(external_id)).await
    }

    async fn relationships(
        &self,
        node_id: &str,
        rel_type: &str,
    ) -> Result<Vec<EdgeDescriptor>, GraphError> {
        self.get_json(&self.relationships_url(node_id, rel_type)).await
    }

    async fn delete_relationship(&self, rel_id: &str) -> Result<(), GraphError> {
        let url = self.batch_url();
        let jobs = serde_json::json!([{
            "method": "DELETE",
            "to": format!("/relationship/{rel_id}"),
            "id": 0,
        }]);
        self.send_with_retry(|| self.client.post(&url).json(&jobs), &url)
            .instrument(info_span!("graph_batch_delete", rel_id))
            .await?;
        Ok(())
    }
}
