//! Job records as delivered by the queue runtime, the validated input they
//! carry, and the envelope every request resolves to.

use serde::{Deserialize, Serialize};

use crate::codec::{Dimensions, ImageSource};
use crate::diagnostics::DiagnosticBundle;
use crate::error::{DispatchFailure, WorkerError, WorkerResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Webp,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
        }
    }

    /// Maps a declared content type onto a known format, if it names one.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let lowered = content_type.to_ascii_lowercase();
        if lowered.contains("image/jpeg") {
            Some(Self::Jpg)
        } else if lowered.contains("image/png") {
            Some(Self::Png)
        } else if lowered.contains("image/webp") {
            Some(Self::Webp)
        } else {
            None
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// One job as handed over by the queue runtime. The id is only used for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRecord {
    pub id: Option<String>,
    pub input: serde_json::Value,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            input,
        }
    }

    /// Lenient extraction from an arbitrary JSON document: a numeric id is
    /// stringified and a missing `input` becomes `null`, which later fails
    /// validation instead of failing here.
    pub fn from_value(value: serde_json::Value) -> Self {
        let id = match value.get("id") {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let input = value
            .get("input")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Self { id, input }
    }

    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("local")
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobInput {
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    #[serde(alias = "format")]
    pub output_format: Option<OutputFormat>,
    pub model_name: Option<String>,
    pub scale: Option<u32>,
    pub tta: bool,
    pub threads: Option<String>,
    pub gpu_id: Option<u32>,
    pub tile_size: Option<u32>,
}

impl JobInput {
    pub fn parse(value: &serde_json::Value) -> WorkerResult<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::default()),
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|err| WorkerError::input(format!("invalid job input: {err}"))),
            other => Err(WorkerError::input(format!(
                "invalid job input: expected an object, got {}",
                json_type_name(other)
            ))),
        }
    }

    /// The single image source this job names.
    pub fn image_source(&self) -> WorkerResult<ImageSource> {
        ImageSource::from_fields(self.image_url.as_deref(), self.image_base64.as_deref())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Success(SuccessEnvelope),
    Failure(FailureEnvelope),
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.error.as_str()),
        }
    }

    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.error_type.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SuccessEnvelope {
    pub image_base64: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_resolution: Option<String>,
    pub output_format: OutputFormat,
}

impl SuccessEnvelope {
    pub fn with_resolutions(
        image_base64: String,
        model: String,
        input: Dimensions,
        output: Dimensions,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            image_base64,
            model,
            scale: None,
            input_resolution: Some(input.to_string()),
            output_resolution: Some(output.to_string()),
            output_format,
        }
    }

    pub fn with_scale(
        image_base64: String,
        model: String,
        scale: u32,
        output_format: OutputFormat,
    ) -> Self {
        Self {
            image_base64,
            model,
            scale: Some(scale),
            input_resolution: None,
            output_resolution: None,
            output_format,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailureEnvelope {
    pub error: String,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<DiagnosticBundle>,
}

impl From<&WorkerError> for FailureEnvelope {
    fn from(err: &WorkerError) -> Self {
        let mut envelope = Self {
            error: err.to_string(),
            error_type: err.kind().to_string(),
            backend_status: None,
            return_code: None,
            stdout: None,
            stderr: None,
            diagnostics: None,
        };

        match err {
            WorkerError::Dispatch(DispatchFailure::DaemonStatus { status, .. }) => {
                envelope.backend_status = Some(*status);
            }
            WorkerError::Dispatch(DispatchFailure::Cli {
                exit_code,
                stdout,
                stderr,
                diagnostics,
                ..
            }) => {
                envelope.return_code = *exit_code;
                envelope.stdout = Some(stdout.clone());
                envelope.stderr = Some(stderr.clone());
                envelope.diagnostics = Some(diagnostics.as_ref().clone());
            }
            _ => {}
        }

        envelope
    }
}
