//! Messages exchanged with a worker subprocess over its standard streams.
//!
//! Coordinator → worker: `{"type":"job","request":{...}}`.
//! Worker → coordinator: zero or more `{"type":"dynamics","data":...}` followed
//! by exactly one `{"type":"result","data":...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobRequest;

/// A job as handed to a worker: the request plus its resolved entry script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    #[serde(flatten)]
    pub request: JobRequest,
    /// Local filename of `sources[0]`, when it was downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl From<JobRequest> for WorkerJob {
    fn from(request: JobRequest) -> Self {
        Self {
            request,
            script: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Job { request: WorkerJob },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// One streamed step.
    Dynamics { data: Value },
    /// Terminal output. Model failures arrive here as `{"error": ...}`.
    Result { data: Value },
}

impl WorkerResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_request_wire_format() {
        let mut request = JobRequest::new("req-1", "py");
        request
            .fixed_params
            .insert("target_steps".into(), json!(3));
        let msg = WorkerRequest::Job {
            request: WorkerJob {
                request,
                script: Some("script_u1_m1.py".to_string()),
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "job",
          "request": {
            "request_id": "req-1",
            "framework": "py",
            "sources": [],
            "fixed_params": {
              "target_steps": 3
            },
            "script": "script_u1_m1.py"
          }
        }
        "#);
    }

    #[test]
    fn responses_parse_from_worker_lines() {
        let dynamics: WorkerResponse =
            serde_json::from_str(r#"{"type":"dynamics","data":{"t":0}}"#).unwrap();
        assert!(!dynamics.is_terminal());

        let result: WorkerResponse =
            serde_json::from_str(r#"{"type":"result","data":{"error":"boom"}}"#).unwrap();
        assert_eq!(
            result,
            WorkerResponse::Result {
                data: json!({"error": "boom"})
            }
        );
        assert!(result.is_terminal());
    }
}
