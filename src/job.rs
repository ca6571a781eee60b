use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-side identity of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        LocalId(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a job in the history.
///
/// A provisional id is minted before the gateway has acknowledged the
/// submission; a persisted id is the one the gateway assigned. The two never
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobId {
    Provisional {
        #[serde(rename = "localId")]
        local_id: LocalId,
    },
    Persisted {
        id: String,
    },
}

impl JobId {
    pub fn provisional(local_id: LocalId) -> Self {
        JobId::Provisional { local_id }
    }

    pub fn persisted(id: impl Into<String>) -> Self {
        JobId::Persisted { id: id.into() }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, JobId::Provisional { .. })
    }

    /// The gateway id, if the job has one.
    pub fn as_persisted(&self) -> Option<&str> {
        match self {
            JobId::Persisted { id } => Some(id),
            JobId::Provisional { .. } => None,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Provisional { local_id } => f.pad(&format!("local:{local_id}")),
            JobId::Persisted { id } => f.pad(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Image,
    Video,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Image => "image",
            Kind::Video => "video",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    #[serde(alias = "generating")]
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether a job currently in `self` may take on `next`.
    ///
    /// Terminal states admit nothing; otherwise the status may stay put or
    /// move forward, never back.
    pub fn admits(&self, next: Status) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageParams {
    pub size: Option<String>,
    pub quality: Option<String>,
    pub seed: Option<i64>,
    pub guidance_scale: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoParams {
    pub resolution: Option<String>,
    pub duration: Option<u32>,
    pub ratio: Option<String>,
    pub fps: Option<u32>,
    pub camera_fixed: Option<bool>,
    pub cfg_scale: Option<f64>,
    pub first_frame_image: Option<String>,
    pub last_frame_image: Option<String>,
}

/// Generation parameters; the variant decides the job's [`Kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Params {
    Image(ImageParams),
    Video(VideoParams),
}

impl Params {
    pub fn kind(&self) -> Kind {
        match self {
            Params::Image(_) => Kind::Image,
            Params::Video(_) => Kind::Video,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub urls: Vec<String>,
    pub thumbnails: Vec<String>,
}

impl JobResult {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.thumbnails.is_empty()
    }
}

/// One generation attempt and its evolving state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub prompt: String,
    pub params: Params,
    pub status: Status,
    pub progress: Option<u8>,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job that the gateway has not acknowledged yet.
    pub fn provisional(local_id: LocalId, prompt: impl Into<String>, params: Params) -> Self {
        let now = Utc::now();
        Job {
            id: JobId::provisional(local_id),
            prompt: prompt.into(),
            params,
            status: Status::Pending,
            progress: Some(0),
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> Kind {
        self.params.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Take on a newer observation of the same job.
    ///
    /// Callers check [`Status::admits`] first. Progress never decreases and
    /// fields the newer observation leaves empty keep their previous value.
    pub(crate) fn absorb(&mut self, next: Job) {
        self.status = next.status;
        self.progress = match (self.progress, next.progress) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };
        if next.result.as_ref().is_some_and(|r| !r.is_empty()) {
            self.result = next.result;
        }
        if next.error_message.is_some() {
            self.error_message = next.error_message;
        }
        if next.updated_at > self.updated_at {
            self.updated_at = next.updated_at;
        }
    }
}
