use crate::job::{Kind, Params};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

pub const SEED_RANGE: RangeInclusive<i64> = -1..=2_147_483_647;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 1.0..=10.0;
pub const DURATION_RANGE: RangeInclusive<u32> = 5..=10;
pub const CFG_SCALE_RANGE: RangeInclusive<f64> = 1.0..=20.0;
pub const COUNT_RANGE: RangeInclusive<u32> = 1..=4;

/// Input that was rejected before reaching the gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt is {len} characters, limit is {max}")]
    PromptTooLong { len: usize, max: usize },
    #[error("{kind} generation requires `{field}`")]
    MissingField { kind: Kind, field: &'static str },
    #[error("`{field}` is {value}, expected {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Options that ride along with a submission without affecting its kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOptions {
    pub watermark: bool,
    pub reference_image: Option<String>,
    pub template_id: Option<i64>,
    pub style_id: Option<i64>,
    pub style: Option<String>,
    pub model: Option<String>,
    pub count: Option<u32>,
    pub hd: Option<bool>,
}

/// What the user asked for, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: Params,
    pub options: SubmitOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: Params) -> Self {
        GenerationRequest {
            prompt: prompt.into(),
            params,
            options: SubmitOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn kind(&self) -> Kind {
        self.params.kind()
    }

    /// Check every local precondition; nothing here touches the network.
    pub fn validate(self, max_prompt_len: usize) -> Result<ValidatedGenerationInput, ValidationError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        let len = prompt.chars().count();
        if len > max_prompt_len {
            return Err(ValidationError::PromptTooLong {
                len,
                max: max_prompt_len,
            });
        }

        match &self.params {
            Params::Image(p) => {
                require(Kind::Image, "size", p.size.as_deref())?;
                require(Kind::Image, "quality", p.quality.as_deref())?;
                if let Some(seed) = p.seed {
                    check_range("seed", seed as f64, *SEED_RANGE.start() as f64, *SEED_RANGE.end() as f64)?;
                }
                if let Some(g) = p.guidance_scale {
                    check_range("guidanceScale", g, *GUIDANCE_RANGE.start(), *GUIDANCE_RANGE.end())?;
                }
            }
            Params::Video(p) => {
                require(Kind::Video, "resolution", p.resolution.as_deref())?;
                let duration = p.duration.ok_or(ValidationError::MissingField {
                    kind: Kind::Video,
                    field: "duration",
                })?;
                check_range(
                    "duration",
                    duration as f64,
                    *DURATION_RANGE.start() as f64,
                    *DURATION_RANGE.end() as f64,
                )?;
                require(Kind::Video, "ratio", p.ratio.as_deref())?;
                if let Some(cfg) = p.cfg_scale {
                    check_range("cfgScale", cfg, *CFG_SCALE_RANGE.start(), *CFG_SCALE_RANGE.end())?;
                }
            }
        }

        if let Some(count) = self.options.count {
            check_range(
                "count",
                count as f64,
                *COUNT_RANGE.start() as f64,
                *COUNT_RANGE.end() as f64,
            )?;
        }

        Ok(ValidatedGenerationInput {
            prompt: prompt.to_string(),
            params: self.params,
            options: self.options,
        })
    }
}

fn require(kind: Kind, field: &'static str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingField { kind, field }),
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value < min || value > max || value.is_nan() {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// A request that passed [`GenerationRequest::validate`]. Only validation
/// can produce one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedGenerationInput {
    prompt: String,
    params: Params,
    options: SubmitOptions,
}

impl ValidatedGenerationInput {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn options(&self) -> &SubmitOptions {
        &self.options
    }

    pub fn kind(&self) -> Kind {
        self.params.kind()
    }
}
