//! Render request as submitted by callers, and its validated form.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Maximum accepted template name length.
const MAX_TEMPLATE_NAME_LEN: usize = 64;

/// Body of `POST /render`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Name of a template from the template library.
    #[serde(default)]
    pub template: Option<String>,
    /// Inline composition source.
    #[serde(default)]
    pub composition_source: Option<String>,
    /// Clip / asset references, passed to the render as runtime data.
    #[serde(default)]
    pub clips: Vec<ClipRef>,
    /// Free-form overlay objects.
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
    /// Per-instance text overlays.
    #[serde(default)]
    pub texts: Vec<serde_json::Value>,
    /// Duration in frames. Takes precedence over `duration_seconds`.
    #[serde(default)]
    pub duration_frames: Option<u32>,
    /// Duration in seconds, converted with `ceil(seconds * fps)`.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Where to POST the completion notification.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// A clip reference: either a bare URL or an object with a `url` and extra options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClipRef {
    Url(String),
    Detailed {
        url: String,
        #[serde(flatten)]
        options: serde_json::Map<String, serde_json::Value>,
    },
}

impl ClipRef {
    pub fn url(&self) -> &str {
        match self {
            ClipRef::Url(url) => url,
            ClipRef::Detailed { url, .. } => url,
        }
    }
}

/// What gets compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    /// A template resolved through the template library.
    Template { name: String },
    /// Caller-supplied source; only accepted behind a sandboxed backend.
    Inline { source: String },
}

impl Composition {
    pub fn is_inline(&self) -> bool {
        matches!(self, Composition::Inline { .. })
    }

    /// Short label for logs.
    pub fn label(&self) -> &str {
        match self {
            Composition::Template { name } => name,
            Composition::Inline { .. } => "<inline>",
        }
    }
}

/// Output geometry; part of the compile cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_frames: u32,
}

/// Per-job runtime data; never part of the compile cache key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderParams {
    pub clips: Vec<ClipRef>,
    pub objects: Vec<serde_json::Value>,
    pub texts: Vec<serde_json::Value>,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct RenderSpec {
    pub composition: Composition,
    pub geometry: OutputGeometry,
    pub params: RenderParams,
    pub callback: Option<Url>,
}

/// Bounds applied during validation.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub max_fps: u32,
    pub max_duration_frames: u32,
    pub max_clips: usize,
    pub max_objects: usize,
    pub max_texts: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            min_dimension: 16,
            max_dimension: 7680,
            max_fps: 120,
            max_duration_frames: 108_000, // one hour at 30 fps
            max_clips: 64,
            max_objects: 128,
            max_texts: 128,
        }
    }
}

impl RenderRequest {
    /// Validate the request shape and convert it into a [`RenderSpec`].
    ///
    /// Only checks what can be decided from the request alone; template
    /// existence, inline-source gating and the callback allowlist are checked
    /// by the scheduler.
    pub fn validate(&self, limits: &RequestLimits) -> Result<RenderSpec> {
        let composition = match (&self.template, &self.composition_source) {
            (Some(_), Some(_)) => {
                return Err(Error::validation(
                    "exactly one of 'template' or 'composition_source' is required, got both",
                ));
            }
            (None, None) => {
                return Err(Error::validation(
                    "exactly one of 'template' or 'composition_source' is required",
                ));
            }
            (Some(name), None) => {
                validate_template_name(name)?;
                Composition::Template { name: name.clone() }
            }
            (None, Some(source)) => {
                if source.trim().is_empty() {
                    return Err(Error::validation("'composition_source' must not be empty"));
                }
                Composition::Inline {
                    source: source.clone(),
                }
            }
        };

        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value < limits.min_dimension || value > limits.max_dimension {
                return Err(Error::validation(format!(
                    "'{field}' must be between {} and {}, got {value}",
                    limits.min_dimension, limits.max_dimension
                )));
            }
        }

        if self.fps == 0 || self.fps > limits.max_fps {
            return Err(Error::validation(format!(
                "'fps' must be between 1 and {}, got {}",
                limits.max_fps, self.fps
            )));
        }

        let duration_frames = self.resolve_duration_frames()?;
        if duration_frames == 0 || duration_frames > limits.max_duration_frames {
            return Err(Error::validation(format!(
                "duration must be between 1 and {} frames, got {duration_frames}",
                limits.max_duration_frames
            )));
        }

        if self.clips.len() > limits.max_clips {
            return Err(Error::validation(format!(
                "at most {} clips are allowed",
                limits.max_clips
            )));
        }
        if self.objects.len() > limits.max_objects {
            return Err(Error::validation(format!(
                "at most {} objects are allowed",
                limits.max_objects
            )));
        }
        if self.texts.len() > limits.max_texts {
            return Err(Error::validation(format!(
                "at most {} texts are allowed",
                limits.max_texts
            )));
        }
        for (index, clip) in self.clips.iter().enumerate() {
            validate_clip_url(index, clip.url())?;
        }

        let callback = match self.callback_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|e| Error::validation(format!("invalid 'callback_url': {e}")))?,
            ),
        };

        Ok(RenderSpec {
            composition,
            geometry: OutputGeometry {
                width: self.width,
                height: self.height,
                fps: self.fps,
                duration_frames,
            },
            params: RenderParams {
                clips: self.clips.clone(),
                objects: self.objects.clone(),
                texts: self.texts.clone(),
            },
            callback,
        })
    }

    fn resolve_duration_frames(&self) -> Result<u32> {
        if let Some(frames) = self.duration_frames {
            return Ok(frames);
        }

        let Some(seconds) = self.duration_seconds else {
            return Err(Error::validation(
                "one of 'duration_frames' or 'duration_seconds' is required",
            ));
        };

        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(Error::validation(
                "'duration_seconds' must be a positive number",
            ));
        }

        let frames = (seconds * f64::from(self.fps)).ceil();
        if frames > f64::from(u32::MAX) {
            return Err(Error::validation("'duration_seconds' is too large"));
        }
        Ok(frames as u32)
    }
}

/// Template names map to files, so they are restricted to a safe alphabet.
pub fn validate_template_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TEMPLATE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid template name '{name}': use 1-{MAX_TEMPLATE_NAME_LEN} characters from [A-Za-z0-9_-]"
        )))
    }
}

fn validate_clip_url(index: usize, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| Error::validation(format!("clips[{index}]: invalid url '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" | "asset" => Ok(()),
        other => Err(Error::validation(format!(
            "clips[{index}]: unsupported scheme '{other}', expected http, https or asset"
        ))),
    }
}
