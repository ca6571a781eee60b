//! The remote generation API.
//!
//! [`Gateway`] is the seam the manager talks through; [`HttpGateway`] is the
//! REST implementation. Every response is wrapped in an envelope
//! `{code, message, data, timestamp, success}` that is unwrapped here.

use crate::error::{Error, Result};
use crate::history::Page;
use crate::job::{ImageParams, Job, JobId, JobResult, Kind, Params, Status, VideoParams};
use crate::request::ValidatedGenerationInput;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Paths whose 401 means the session itself is no longer valid.
pub const IDENTITY_PATHS: &[&str] = &["/users/login", "/users/register", "/users/profile"];

pub fn is_identity_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    IDENTITY_PATHS.contains(&path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    pub kind: Option<Kind>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn submit(&self, input: &ValidatedGenerationInput) -> Result<Job>;

    async fn fetch(&self, id: &str) -> Result<Job>;

    async fn list(&self, query: ListQuery) -> Result<Page>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn batch_delete(&self, ids: &[String]) -> Result<()>;

    /// Most recent jobs, newest first.
    async fn recent(&self, limit: u32) -> Result<Vec<Job>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Code {
    Int(i64),
    Text(String),
}

impl Code {
    fn is_ok(&self) -> bool {
        match self {
            Code::Int(code) => *code == 200,
            Code::Text(code) => code == "200",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Int(code) => write!(f, "{code}"),
            Code::Text(code) => f.write_str(code),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Code,
    message: Option<String>,
    data: Option<Value>,
    success: Option<bool>,
}

impl Envelope {
    fn is_ok(&self) -> bool {
        self.success.unwrap_or(true) && self.code.is_ok()
    }
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Int(id) => id.to_string(),
        RawId::Text(id) => id,
    })
}

/// A generated content record as the server sends it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default)]
    pub prompt: String,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub urls: Option<Vec<String>>,
    pub thumbnails: Option<Vec<String>>,
    pub size: Option<String>,
    pub generation_params: Option<Map<String, Value>>,
    pub status: Status,
    pub progress: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ts| ts.and_utc())
}

impl ContentRecord {
    fn params(&self) -> Params {
        let empty = Map::new();
        let gp = self.generation_params.as_ref().unwrap_or(&empty);
        let text = |key: &str| gp.get(key).and_then(Value::as_str).map(str::to_string);
        let int = |key: &str| gp.get(key).and_then(Value::as_i64);
        let float = |key: &str| gp.get(key).and_then(Value::as_f64);

        match self.kind {
            Kind::Image => Params::Image(ImageParams {
                size: self.size.clone().or_else(|| text("size")),
                quality: text("quality"),
                seed: int("seed"),
                guidance_scale: float("guidanceScale"),
            }),
            Kind::Video => Params::Video(VideoParams {
                resolution: text("resolution"),
                duration: int("duration").and_then(|d| u32::try_from(d).ok()),
                ratio: text("ratio"),
                fps: int("fps").and_then(|f| u32::try_from(f).ok()),
                camera_fixed: gp.get("cameraFixed").and_then(Value::as_bool),
                cfg_scale: float("cfgScale"),
                first_frame_image: text("firstFrameImage"),
                last_frame_image: text("lastFrameImage"),
            }),
        }
    }

    fn result(&self) -> Option<JobResult> {
        let mut result = JobResult::default();
        result.urls.extend(self.url.iter().cloned());
        result.thumbnails.extend(self.thumbnail.iter().cloned());
        for url in self.urls.iter().flatten() {
            if !result.urls.contains(url) {
                result.urls.push(url.clone());
            }
        }
        for thumb in self.thumbnails.iter().flatten() {
            if !result.thumbnails.contains(thumb) {
                result.thumbnails.push(thumb.clone());
            }
        }
        (!result.is_empty()).then_some(result)
    }
}

impl From<ContentRecord> for Job {
    fn from(record: ContentRecord) -> Self {
        let params = record.params();
        let result = record.result();
        let now = Utc::now();
        let created_at = parse_timestamp(record.created_at.as_deref()).unwrap_or(now);
        let updated_at = parse_timestamp(record.updated_at.as_deref()).unwrap_or(created_at);
        let progress = match record.status {
            Status::Completed => Some(100),
            _ => record.progress.map(|p| p.clamp(0.0, 100.0) as u8),
        };

        Job {
            id: JobId::persisted(record.id),
            prompt: record.prompt,
            params,
            status: record.status,
            progress,
            result,
            error_message: record.error_message,
            created_at,
            updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageRecord {
    #[serde(default)]
    records: Vec<ContentRecord>,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    current: u32,
    #[serde(default)]
    size: u32,
    #[serde(default)]
    pages: u32,
    has_next: Option<bool>,
    has_previous: Option<bool>,
}

impl From<PageRecord> for Page {
    fn from(page: PageRecord) -> Self {
        Page {
            has_next: page.has_next.unwrap_or(page.current < page.pages),
            has_previous: page.has_previous.unwrap_or(page.current > 1),
            records: page.records.into_iter().map(Job::from).collect(),
            total: page.total,
            current: page.current,
            size: page.size,
            pages: page.pages,
        }
    }
}

/// Request body of `POST /contents/generate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload<'a> {
    #[serde(rename = "type")]
    kind: Kind,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ratio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    camera_fixed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cfg_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_frame_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_frame_image: Option<&'a str>,
    watermark: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    style_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hd: Option<bool>,
}

impl<'a> From<&'a ValidatedGenerationInput> for SubmitPayload<'a> {
    fn from(input: &'a ValidatedGenerationInput) -> Self {
        let options = input.options();
        let mut payload = SubmitPayload {
            kind: input.kind(),
            prompt: input.prompt(),
            size: None,
            quality: None,
            seed: None,
            guidance_scale: None,
            resolution: None,
            duration: None,
            ratio: None,
            fps: None,
            camera_fixed: None,
            cfg_scale: None,
            first_frame_image: None,
            last_frame_image: None,
            watermark: options.watermark,
            reference_image: options.reference_image.as_deref(),
            template_id: options.template_id,
            style_id: options.style_id,
            // styleId wins over a free-form style name
            style: options.style.as_deref().filter(|_| options.style_id.is_none()),
            model: options.model.as_deref(),
            count: options.count,
            hd: options.hd,
        };
        match input.params() {
            Params::Image(p) => {
                payload.size = p.size.as_deref();
                payload.quality = p.quality.as_deref();
                payload.seed = p.seed;
                payload.guidance_scale = p.guidance_scale;
            }
            Params::Video(p) => {
                payload.resolution = p.resolution.as_deref();
                payload.duration = p.duration;
                payload.ratio = p.ratio.as_deref();
                payload.fps = p.fps;
                payload.camera_fixed = p.camera_fixed;
                payload.cfg_scale = p.cfg_scale;
                payload.first_frame_image = p.first_frame_image.as_deref();
                payload.last_frame_image = p.last_frame_image.as_deref();
            }
        }
        payload
    }
}

#[derive(Debug, Serialize)]
struct BatchDelete<'a> {
    ids: &'a [String],
}

fn decode<T: DeserializeOwned>(data: Option<Value>) -> Result<T> {
    let data = data.ok_or_else(|| Error::Decode("response carried no data".into()))?;
    Ok(serde_json::from_value(data)?)
}

/// REST client for the generation API.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.read().is_some())
            .finish()
    }
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpGateway {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub fn with_token(self, token: Option<String>) -> Self {
        *self.token.write() = token;
        self
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match self.token.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send `builder` and unwrap the response envelope.
    async fn execute(&self, builder: RequestBuilder, path: &str) -> Result<Option<Value>> {
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            let session_cleared = is_identity_path(path);
            if session_cleared {
                warn!(path, "identity endpoint rejected the session, clearing token");
                self.set_token(None);
            } else {
                warn!(path, "unauthorized response, session left in place");
            }
            return Err(Error::Unauthorized {
                path: path.to_string(),
                session_cleared,
            });
        }

        let body = response.bytes().await?;
        let envelope: Envelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::Api {
                    code: status.as_u16().to_string(),
                    message: status.canonical_reason().unwrap_or("request failed").to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        if !status.is_success() || !envelope.is_ok() {
            debug!(path, code = %envelope.code, "gateway reported failure");
            return Err(Error::Api {
                code: envelope.code.to_string(),
                message: envelope
                    .message
                    .unwrap_or_else(|| format!("request failed: {status}")),
            });
        }

        Ok(envelope.data)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    #[instrument(name = "gateway.submit", skip_all, fields(kind = %input.kind()))]
    async fn submit(&self, input: &ValidatedGenerationInput) -> Result<Job> {
        let path = "/contents/generate";
        let builder = self.request(Method::POST, path).json(&SubmitPayload::from(input));
        let record: ContentRecord = decode(self.execute(builder, path).await?)?;
        Ok(record.into())
    }

    #[instrument(name = "gateway.fetch", skip(self))]
    async fn fetch(&self, id: &str) -> Result<Job> {
        let path = format!("/contents/{id}");
        let builder = self.request(Method::GET, &path);
        let record: ContentRecord = decode(self.execute(builder, &path).await?)?;
        Ok(record.into())
    }

    #[instrument(name = "gateway.list", skip(self))]
    async fn list(&self, query: ListQuery) -> Result<Page> {
        let path = "/contents";
        let mut params = vec![("page", query.page.to_string()), ("limit", query.limit.to_string())];
        if let Some(kind) = query.kind {
            params.push(("type", kind.to_string()));
        }
        let builder = self.request(Method::GET, path).query(&params);
        let page: PageRecord = decode(self.execute(builder, path).await?)?;
        Ok(page.into())
    }

    #[instrument(name = "gateway.delete", skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let path = format!("/contents/{id}");
        let builder = self.request(Method::DELETE, &path);
        self.execute(builder, &path).await?;
        Ok(())
    }

    #[instrument(name = "gateway.batch_delete", skip(self), fields(count = ids.len()))]
    async fn batch_delete(&self, ids: &[String]) -> Result<()> {
        let path = "/contents/batch-delete";
        let builder = self.request(Method::POST, path).json(&BatchDelete { ids });
        self.execute(builder, path).await?;
        Ok(())
    }

    #[instrument(name = "gateway.recent", skip(self))]
    async fn recent(&self, limit: u32) -> Result<Vec<Job>> {
        let path = "/contents/recent";
        let builder = self.request(Method::GET, path).query(&[("limit", limit)]);
        let records: Vec<ContentRecord> = decode(self.execute(builder, path).await?)?;
        Ok(records.into_iter().map(Job::from).collect())
    }
}
