//! Lifecycle management for asynchronously produced image and video
//! generations: optimistic submission, per-job status polling and a
//! paginated, de-duplicated history, all over a REST gateway.

pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod job;
pub mod manager;
mod poller;
pub mod request;
pub mod telemetry;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use gateway::{Gateway, HttpGateway, ListQuery};
pub use history::{History, Page, PageCursor, Update};
pub use job::{ImageParams, Job, JobId, JobResult, Kind, LocalId, Params, Status, VideoParams};
pub use manager::{JobManager, Notice};
pub use request::{GenerationRequest, SubmitOptions, ValidatedGenerationInput, ValidationError};
