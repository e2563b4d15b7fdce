//! REST API source and target handler.
//!
//! `source_ref`/`target_ref` are collection paths relative to the base URL.
//! Collections are read with `GET`, following `next` links until exhausted;
//! objects are created with `POST`, updated with `PUT` and removed with
//! `DELETE` on `{collection}/{id}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::handler::{ObjectStream, SourceHandler, TargetHandler};
use crate::{SourceObject, SyncError};

/// Handler type served by [`RestApiHandler`].
pub const API_TYPE: &str = "api";

/// Wait applied when a 429 carries no usable reset header.
const DEFAULT_RETRY_SECS: i64 = 60;

/// Longest wait a rate limit header can impose (30 days).
const MAX_RETRY_SECS: i64 = 30 * 86_400;

/// `X-RateLimit-Reset` values below this are deltas, not epoch seconds.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Keys a paginated envelope may keep its objects under.
const ITEM_KEYS: [&str; 3] = ["items", "results", "data"];

/// HTTP handler for JSON REST collections.
pub struct RestApiHandler {
    http: Client,
    base_url: String,
}

impl RestApiHandler {
    /// Create a handler with its own client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a handler sharing an existing client.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn object_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.url(collection).trim_end_matches('/'), id)
    }

    async fn create(&self, collection: &str, object: &Value) -> Result<String, SyncError> {
        let url = self.url(collection);
        let response = self.http.post(&url).json(object).send().await?;
        let response = check_status(response, &format!("POST {}", url)).await?;
        let created: Value = response.json().await?;
        object_id(&created)
            .ok_or_else(|| SyncError::Validation(format!("POST {} returned no id", url)))
    }

    async fn fetch_page(&self, url: &str) -> Result<Page, SyncError> {
        debug!(url, "fetching page");
        let response = self.http.get(url).send().await?;
        let response = check_status(response, &format!("GET {}", url)).await?;
        let body: Value = response.json().await?;
        parse_page(body)
    }
}

struct Page {
    objects: Vec<SourceObject>,
    next: Option<String>,
}

fn parse_page(body: Value) -> Result<Page, SyncError> {
    let (items, next) = match body {
        Value::Array(items) => (items, None),
        Value::Object(mut envelope) => {
            let next = envelope
                .get("next")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            let items = ITEM_KEYS
                .into_iter()
                .find_map(|key| match envelope.remove(key) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| {
                    SyncError::Validation(format!(
                        "page has no {} array",
                        ITEM_KEYS.join("/")
                    ))
                })?;
            (items, next)
        }
        other => {
            return Err(SyncError::Validation(format!(
                "unexpected page body: {}",
                other
            )));
        }
    };

    let objects = items
        .into_iter()
        .filter_map(|item| match object_id(&item) {
            Some(id) => Some(SourceObject::new(id, item)),
            None => {
                warn!("skipping object without an id");
                None
            }
        })
        .collect();

    Ok(Page { objects, next })
}

/// The `id` field of an object, string or number.
pub(crate) fn object_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Map a non-success response onto the error taxonomy.
pub(crate) async fn check_status(response: Response, context: &str) -> Result<Response, SyncError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset_at = rate_limit_reset(response.headers(), Utc::now());
        warn!(context, reset_at = %reset_at, "rate limited");
        return Err(SyncError::RateLimited {
            reset_at,
            context: Some(context.to_string()),
        });
    }

    let text = response.text().await.unwrap_or_default();
    let detail = format!("{} failed ({}): {}", context, status, text);

    Err(match status {
        s if s.is_server_error() => SyncError::TransientIo(detail),
        StatusCode::REQUEST_TIMEOUT => SyncError::TransientIo(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => SyncError::NotFound(context.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            SyncError::Validation(detail)
        }
        _ => SyncError::Configuration(detail),
    })
}

/// When a throttled request may be retried.
///
/// Reads `X-RateLimit-Reset` (epoch seconds, or a delta when small), then
/// `Retry-After` (delta seconds or an HTTP date), then falls back to a
/// fixed wait. Waits longer than [`MAX_RETRY_SECS`] are cut to that bound.
pub fn rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .map(str::to_string)
    };
    let latest = after(now, MAX_RETRY_SECS);

    if let Some(reset) = header("X-RateLimit-Reset").and_then(|v| v.parse::<i64>().ok()) {
        if reset >= EPOCH_THRESHOLD {
            if let Some(at) = DateTime::from_timestamp(reset, 0) {
                return at.min(latest);
            }
        } else {
            return after(now, reset);
        }
    }

    if let Some(retry_after) = header("Retry-After") {
        if let Ok(secs) = retry_after.parse::<i64>() {
            return after(now, secs);
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(&retry_after) {
            return at.with_timezone(&Utc).min(latest);
        }
    }

    after(now, DEFAULT_RETRY_SECS)
}

fn after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    chrono::Duration::try_seconds(secs.clamp(0, MAX_RETRY_SECS))
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(now)
}

#[async_trait]
impl SourceHandler for RestApiHandler {
    fn source_type(&self) -> &str {
        API_TYPE
    }

    fn objects<'a>(&'a self, source_ref: &'a str) -> ObjectStream<'a> {
        stream::try_unfold(Some(self.url(source_ref)), move |next| async move {
            let Some(url) = next else {
                return Ok::<_, SyncError>(None);
            };
            let page = self.fetch_page(&url).await?;
            let next = page.next.map(|n| self.url(&n)).filter(|n| *n != url);
            let objects = stream::iter(page.objects.into_iter().map(Ok::<_, SyncError>));
            Ok(Some((objects, next)))
        })
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl TargetHandler for RestApiHandler {
    fn target_type(&self) -> &str {
        API_TYPE
    }

    async fn write(
        &self,
        target_ref: &str,
        target_id: Option<&str>,
        object: &Value,
    ) -> Result<String, SyncError> {
        let Some(id) = target_id else {
            return self.create(target_ref, object).await;
        };

        let url = self.object_url(target_ref, id);
        let response = self.http.put(&url).json(object).send().await?;
        match check_status(response, &format!("PUT {}", url)).await {
            Ok(_) => Ok(id.to_string()),
            Err(SyncError::NotFound(_)) => {
                warn!(url, "target object is gone, creating it again");
                self.create(target_ref, object).await
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, target_ref: &str, target_id: &str) -> Result<(), SyncError> {
        let url = self.object_url(target_ref, target_id);
        let response = self.http.delete(&url).send().await?;
        match check_status(response, &format!("DELETE {}", url)).await {
            Ok(_) | Err(SyncError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
