use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::USER_AGENT;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://linux.do/";

/// Discourse encodes a like as post action type 2.
pub const LIKE_ACTION_ID: i64 = 2;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BATCH_SIZE: usize = 200;

static TOPIC_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/t/[^/]+/(\d+)").expect("topic id regex"));

/// Pulls the numeric topic id out of a `/t/{slug}/{id}[/{post}]` URL.
pub fn extract_topic_id(url: &str) -> Option<u64> {
    TOPIC_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("too many requests, retry later")]
    RateLimited,
    #[error("not permitted to view this content")]
    Forbidden,
    #[error("content does not exist")]
    NotFound,
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{failed} of {total} post batches failed")]
    PartialBatch { failed: usize, total: usize },
}

impl FetchError {
    fn from_status(status: StatusCode, body: &str) -> Self {
        match status.as_u16() {
            429 => FetchError::RateLimited,
            403 => FetchError::Forbidden,
            404 => FetchError::NotFound,
            _ => {
                // Discourse error bodies carry {"errors": ["..."]}; prefer
                // that message over the bare status line when present.
                let detail = serde_json::from_str::<ErrorEnvelope>(body)
                    .ok()
                    .and_then(|env| env.errors.into_iter().next())
                    .unwrap_or_else(|| status.to_string());
                FetchError::Network(detail)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub user_agent: String,
    pub csrf_token: Option<String>,
    pub min_interval: Duration,
    pub batch_size: usize,
    pub http_client: Option<HttpClient>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            user_agent: String::new(),
            csrf_token: None,
            min_interval: DEFAULT_MIN_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            http_client: None,
        }
    }
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    csrf_token: Option<String>,
    min_interval: Duration,
    batch_size: usize,
    last_request: Mutex<Option<Instant>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("discourse client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            csrf_token: config.csrf_token,
            min_interval: config.min_interval,
            batch_size: config.batch_size.max(1),
            last_request: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn topic_url(&self, topic_id: u64) -> String {
        format!("{}t/topic/{}", self.base_url, topic_id)
    }

    /// Fetch a topic summary plus the initial window of posts the server
    /// chooses to send along.
    pub fn fetch_topic(&self, url: &str) -> Result<TopicResponse, FetchError> {
        let json_url = if url.ends_with(".json") {
            url.to_string()
        } else {
            format!("{}.json", url.trim_end_matches('/'))
        };
        let resp = self.request(Method::GET, &json_url, &[])?;
        let body = resp
            .text()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| FetchError::Malformed(err.to_string()))
    }

    pub fn fetch_topic_by_id(&self, topic_id: u64) -> Result<TopicResponse, FetchError> {
        let url = self
            .base_url
            .join(&format!("t/{}.json", topic_id))
            .map_err(|err| FetchError::Network(err.to_string()))?;
        self.fetch_topic(url.as_str())
    }

    /// Fetch specific posts by id. The id list is chunked into batches of
    /// `batch_size` and the batches are issued sequentially so the rate
    /// floor applies between them. A failed batch is logged and skipped;
    /// posts from the other batches are still returned.
    pub fn fetch_posts(&self, topic_id: u64, post_ids: &[u64]) -> PostBatches {
        let mut out = PostBatches::default();
        if post_ids.is_empty() {
            return out;
        }
        for chunk in post_ids.chunks(self.batch_size) {
            out.total_batches += 1;
            match self.fetch_post_batch(topic_id, chunk) {
                Ok(posts) => out.posts.extend(posts),
                Err(err) => {
                    log::warn!(
                        "topic {}: post batch of {} failed: {}",
                        topic_id,
                        chunk.len(),
                        err
                    );
                    out.failed_batches += 1;
                }
            }
        }
        out
    }

    fn fetch_post_batch(&self, topic_id: u64, chunk: &[u64]) -> Result<Vec<Post>, FetchError> {
        let path = format!("t/{}/posts.json", topic_id);
        let params: Vec<(String, String)> = chunk
            .iter()
            .map(|id| ("post_ids[]".to_string(), id.to_string()))
            .collect();
        let resp = self.request_path(Method::GET, &path, &params)?;
        let body = resp
            .text()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let payload: PostsResponse =
            serde_json::from_str(&body).map_err(|err| FetchError::Malformed(err.to_string()))?;
        Ok(payload.post_stream.posts)
    }

    /// Like a post on behalf of the signed-in user. Discourse wants a
    /// form-urlencoded body here, not JSON.
    pub fn like_post(&self, post_id: u64) -> Result<(), FetchError> {
        let form = vec![
            ("id".to_string(), post_id.to_string()),
            ("post_action_type_id".to_string(), LIKE_ACTION_ID.to_string()),
        ];
        self.request_form(Method::POST, "post_actions", form)?;
        Ok(())
    }

    pub fn unlike_post(&self, post_id: u64) -> Result<(), FetchError> {
        let path = format!("post_actions/{}", post_id);
        let params = vec![(
            "post_action_type_id".to_string(),
            LIKE_ACTION_ID.to_string(),
        )];
        self.request_path(Method::DELETE, &path, &params)?;
        Ok(())
    }

    pub fn bookmark_topic(&self, topic_id: u64) -> Result<(), FetchError> {
        let path = format!("t/{}/bookmark", topic_id);
        self.request_path(Method::PUT, &path, &[])?;
        Ok(())
    }

    pub fn unbookmark_topic(&self, topic_id: u64) -> Result<(), FetchError> {
        let path = format!("t/{}/remove_bookmarks", topic_id);
        self.request_path(Method::PUT, &path, &[])?;
        Ok(())
    }

    fn request_path(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Response, FetchError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| FetchError::Network(err.to_string()))?;
        self.request(method, url.as_str(), params)
    }

    fn request_form(
        &self,
        method: Method,
        path: &str,
        form: Vec<(String, String)>,
    ) -> Result<Response, FetchError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let req = self.http.request(method, url).form(&form);
        self.send(req)
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Response, FetchError> {
        let mut url =
            Url::parse(url).map_err(|err| FetchError::Network(err.to_string()))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        let req = self.http.request(method, url);
        self.send(req)
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, FetchError> {
        self.throttle();
        let mut req = req.header(USER_AGENT, self.user_agent.clone());
        req = req.header("X-Requested-With", "XMLHttpRequest");
        if let Some(token) = &self.csrf_token {
            req = req.header("X-CSRF-Token", token.clone());
        }

        let resp = req
            .send()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            Err(FetchError::from_status(status, &body))
        }
    }

    /// Global floor between requests. A call arriving early is delayed,
    /// never rejected; the lock is held across the sleep so concurrent
    /// callers queue behind it.
    fn throttle(&self) {
        let mut last = self.last_request.lock();
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// Posts accumulated across a chunked fetch. Failed batches are counted
/// rather than aborting the whole fetch.
#[derive(Debug, Default)]
pub struct PostBatches {
    pub posts: Vec<Post>,
    pub failed_batches: usize,
    pub total_batches: usize,
}

impl PostBatches {
    pub fn partial_failure(&self) -> Option<FetchError> {
        if self.failed_batches > 0 {
            Some(FetchError::PartialBatch {
                failed: self.failed_batches,
                total: self.total_batches,
            })
        } else {
            None
        }
    }

    pub fn all_failed(&self) -> bool {
        self.total_batches > 0 && self.failed_batches == self.total_batches
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicResponse {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub posts_count: i64,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub bookmarked: Option<bool>,
    #[serde(default)]
    pub category_id: Option<u64>,
    #[serde(default)]
    pub slug: String,
    pub post_stream: PostStream,
}

impl TopicResponse {
    /// Snapshot of the summary fields the overlay tracks per topic.
    pub fn topic(&self) -> Topic {
        Topic {
            id: self.id,
            title: self.title.clone(),
            posts_count: self.posts_count,
            like_count: self.like_count,
            bookmarked: self.bookmarked.unwrap_or(false),
            stream: self.post_stream.stream.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostStream {
    #[serde(default)]
    pub stream: Vec<u64>,
    #[serde(default)]
    pub posts: Vec<Post>,
}

/// Topic summary plus the full ordered id stream. Replaced wholesale on
/// refresh; the counters are the only fields mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: u64,
    pub title: String,
    pub posts_count: i64,
    pub like_count: i64,
    pub bookmarked: bool,
    pub stream: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub post_number: u32,
    pub username: String,
    #[serde(default)]
    pub display_username: String,
    pub created_at: DateTime<Utc>,
    /// Rendered body HTML; opaque to this crate.
    #[serde(default)]
    pub cooked: String,
    #[serde(default)]
    pub reply_to_post_number: Option<u32>,
    #[serde(default)]
    pub actions_summary: Vec<ActionSummary>,
    #[serde(default)]
    pub topic_id: u64,
    #[serde(default)]
    pub avatar_template: String,
}

impl Post {
    pub fn like_summary(&self) -> Option<&ActionSummary> {
        self.actions_summary
            .iter()
            .find(|action| action.id == LIKE_ACTION_ID)
    }

    pub fn like_count(&self) -> i64 {
        self.like_summary().map(|action| action.count).unwrap_or(0)
    }

    pub fn liked_by_me(&self) -> bool {
        self.like_summary()
            .map(|action| action.acted)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub id: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub acted: bool,
    #[serde(default = "default_can_act")]
    pub can_act: bool,
}

fn default_can_act() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct PostsResponse {
    post_stream: PostStream,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<String>,
}
