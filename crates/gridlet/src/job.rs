//! Job requests and the mode a request's shape selects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::Credentials;

pub type Params = Map<String, Value>;

/// An id that cannot be used as part of a file name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} {value:?} is not a valid file name component")]
pub struct InvalidId {
    pub field: &'static str,
    pub value: String,
}

/// Check that `value` can be joined onto a directory as part of a file name
/// without leaving it: non-empty, no path separators, no `..`.
pub fn check_file_id(field: &'static str, value: &str) -> Result<(), InvalidId> {
    let bad = value.is_empty()
        || value.contains("..")
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(InvalidId {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// A model file referenced by a job. `sources[0]` is the entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub model_id: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Filled from the envelope when absent from the body.
    #[serde(default)]
    pub request_id: String,
    pub framework: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub fixed_params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_params: Option<Vec<Params>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<Vec<Vec<Params>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// `fixed_params.test` is true: call each model entry point once.
    Introspection,
    /// `variable_params` present: one run per override map.
    Sweep,
    /// `collection` present: sweeps run batch by batch.
    Batched,
    /// Neither: step the model and stream every step.
    Streaming,
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Introspection => "introspection",
            Self::Sweep => "sweep",
            Self::Batched => "batched",
            Self::Streaming => "streaming",
        })
    }
}

impl JobRequest {
    pub fn new(request_id: impl Into<String>, framework: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            framework: framework.into(),
            sources: Vec::new(),
            fixed_params: Params::new(),
            variable_params: None,
            collection: None,
            credentials: None,
        }
    }

    pub fn mode(&self) -> JobMode {
        if matches!(self.fixed_params.get("test"), Some(Value::Bool(true))) {
            JobMode::Introspection
        } else if self.collection.is_some() {
            JobMode::Batched
        } else if self.variable_params.is_some() {
            JobMode::Sweep
        } else {
            JobMode::Streaming
        }
    }

    /// Number of steps a streaming job runs, never below 1.
    pub fn target_steps(&self) -> u64 {
        self.fixed_params
            .get("target_steps")
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
            .unwrap_or(0)
            .max(1)
    }

    /// `fixed_params` overlaid with one override map.
    pub fn merged_params(&self, overrides: &Params) -> Params {
        let mut params = self.fixed_params.clone();
        for (k, v) in overrides {
            params.insert(k.clone(), v.clone());
        }
        params
    }
}
