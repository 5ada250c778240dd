//! Client for the external ticketing backend's REST API.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use crate::core::config::RemoteConfig;

const TICKET_FIELDS: &str = "ticketid,description,status";
const WORKLOG_FIELDS: &str =
    "ticketid,worklog{recordkey,createby,createdate,description,description_longdescription}";
const SHORT_DESCRIPTION_CHARS: usize = 100;

/// Failures of the remote API. `Unavailable`, `Rejected` and `Malformed` from
/// a bulk read all abort the reconciliation run before any local write.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport failure, timeout or transient status that outlived the retries.
    #[error("remote ticketing unavailable: {0}")]
    Unavailable(String),
    #[error("remote ticketing rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("remote ticketing returned a malformed payload: {0}")]
    Malformed(String),
    #[error("remote ticketing client misconfigured: {0}")]
    Configuration(String),
}

/// One remote ticket as returned by the bulk read.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteTicketRecord {
    #[serde(rename = "ticketid", default, deserialize_with = "deserialize_stringish")]
    pub external_id: String,
    #[serde(default, deserialize_with = "deserialize_stringish")]
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_stringish")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RemoteWorklog {
    #[serde(rename = "recordkey", default, deserialize_with = "deserialize_stringish")]
    pub record_key: String,
    #[serde(rename = "createby", default, deserialize_with = "deserialize_stringish")]
    pub created_by: String,
    /// Raw timestamp as sent by the backend, e.g. `2024-03-01T10:15:00-03:00`.
    #[serde(rename = "createdate", default, deserialize_with = "deserialize_stringish")]
    pub created_at: String,
    #[serde(default, deserialize_with = "deserialize_stringish")]
    pub description: String,
    #[serde(
        rename = "description_longdescription",
        default,
        deserialize_with = "deserialize_stringish"
    )]
    pub long_description: String,
}

#[derive(Debug, Deserialize)]
struct MemberPage<T> {
    #[serde(default = "Vec::new")]
    member: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WorklogHolder {
    #[serde(default)]
    worklog: Vec<RemoteWorklog>,
}

/// Worklog visibility on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorklogChannel {
    InternalNote,
    CustomerNote,
}

impl WorklogChannel {
    pub fn for_author(in_support_team: bool) -> Self {
        if in_support_team {
            Self::InternalNote
        } else {
            Self::CustomerNote
        }
    }

    pub fn logtype(self) -> &'static str {
        match self {
            Self::InternalNote => "WORK",
            Self::CustomerNote => "CLIENTNOTE",
        }
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    pub fn is_transient(status: StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
    }
}

#[async_trait]
pub trait RemoteTicketing: Send + Sync {
    /// Every remote ticket, restricted to id, status and description.
    async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError>;

    async fn fetch_worklogs(&self, external_id: &str) -> Result<Vec<RemoteWorklog>, RemoteError>;

    /// Posts one worklog entry. Never fails: problems are logged and reported
    /// as `false`.
    async fn submit_interaction(
        &self,
        external_id: &str,
        author_label: &str,
        channel: WorklogChannel,
        body: &str,
    ) -> bool;
}

#[derive(Clone)]
pub struct HttpRemoteClient {
    api_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpRemoteClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpRemoteClient")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            return Err(RemoteError::Configuration("remote.api_url is empty".to_string()));
        }
        let api_key = config.api_key.trim();
        if api_key.is_empty() {
            return Err(RemoteError::Configuration("remote.api_key is empty".to_string()));
        }

        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(api_key)
            .map_err(|e| RemoteError::Configuration(format!("remote.api_key is invalid: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_tls)
            .no_proxy()
            .build()
            .map_err(|e| RemoteError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_url,
            client,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.backoff_base_ms),
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn get_with_retry(&self, query: &[(&str, &str)]) -> Result<String, RemoteError> {
        let mut retry = 0;
        loop {
            let failure = match self.client.get(&self.api_url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(|e| {
                            RemoteError::Unavailable(format!("response read failed: {e}"))
                        });
                    }
                    let body = response.text().await.unwrap_or_default();
                    if !RetryPolicy::is_transient(status) {
                        return Err(RemoteError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    format!("status {status}")
                }
                Err(e) if e.is_builder() => {
                    return Err(RemoteError::Configuration(e.to_string()));
                }
                Err(e) => format!("request failed: {e}"),
            };

            if retry >= self.retry.max_retries {
                return Err(RemoteError::Unavailable(format!(
                    "{failure} after {} attempts",
                    retry + 1
                )));
            }
            let delay = self.retry.delay_for(retry);
            warn!(
                "remote GET failed ({failure}), retry {}/{} in {delay:?}",
                retry + 1,
                self.retry.max_retries
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[async_trait]
impl RemoteTicketing for HttpRemoteClient {
    async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError> {
        let body = self
            .get_with_retry(&[
                ("_dropnulls", "0"),
                ("lean", "1"),
                ("oslc.select", TICKET_FIELDS),
            ])
            .await?;
        let page: MemberPage<RemoteTicketRecord> =
            serde_json::from_str(&body).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        debug!("fetched {} remote tickets", page.member.len());
        Ok(page.member)
    }

    async fn fetch_worklogs(&self, external_id: &str) -> Result<Vec<RemoteWorklog>, RemoteError> {
        let filter = format!("ticketid=\"{external_id}\"");
        let body = self
            .get_with_retry(&[
                ("lean", "1"),
                ("oslc.where", filter.as_str()),
                ("oslc.select", WORKLOG_FIELDS),
            ])
            .await?;
        let page: MemberPage<WorklogHolder> =
            serde_json::from_str(&body).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(page
            .member
            .into_iter()
            .flat_map(|holder| holder.worklog)
            .collect())
    }

    async fn submit_interaction(
        &self,
        external_id: &str,
        author_label: &str,
        channel: WorklogChannel,
        body: &str,
    ) -> bool {
        let payload = worklog_payload(external_id, author_label, channel, body);
        let response = self
            .client
            .post(&self.api_url)
            .query(&[("lean", "1")])
            .header("x-method-override", "SYNC")
            .header("patchtype", "MERGE")
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!("worklog posted to external_id={external_id}");
                true
            }
            Ok(response) => {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                warn!("worklog for external_id={external_id} rejected with {status}: {detail}");
                false
            }
            Err(e) => {
                warn!("worklog for external_id={external_id} failed: {e}");
                false
            }
        }
    }
}

fn worklog_payload(
    external_id: &str,
    author_label: &str,
    channel: WorklogChannel,
    body: &str,
) -> Value {
    let short: String = body.chars().take(SHORT_DESCRIPTION_CHARS).collect();
    json!({
        "ticketid": external_id,
        "class": "SR",
        "worklog": [{
            "description": short,
            "description_longdescription": body,
            "logtype": channel.logtype(),
            "createby": author_label,
        }],
    })
}

fn json_value_to_string(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

fn deserialize_stringish<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(|v| json_value_to_string(&v)).unwrap_or_default())
}
