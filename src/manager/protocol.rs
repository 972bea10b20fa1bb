//! Wire messages exchanged with the Manager's endpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::LocalConf;
use crate::scheduler::{Job, JobCounts, JobId, NodeHealth, NodeReport};

/// Answer text acknowledging a whole submission.
pub const JOB_QUEUED: &str = "Job queued";

/// Rejection reason when a submission would exceed `manager.max_jobs`.
pub const QUEUE_FULL: &str = "job queue at capacity";

/// Conventional body of a status query. Any body is accepted.
pub const STATUS_REQUEST: &[u8] = b"status";

/// Generic acknowledgement: `{"ans": ...}` with an optional failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ans: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn queued() -> Self {
        Self {
            ans: JOB_QUEUED.to_string(),
            reason: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            ans: "ok".to_string(),
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            ans: "error".to_string(),
            reason: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.ans == "error"
    }
}

/// Reply of the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub cluster: BTreeMap<String, NodeReport>,
    #[serde(rename = "active jobs")]
    pub active_jobs: Vec<JobId>,
    pub jobs: JobCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfReply {
    pub localconf: LocalConf,
}

/// Reply of the configuration-distribution endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Conf(ConfReply),
    Ack(Ack),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node: String,
    #[serde(flatten)]
    pub health: NodeHealth,
}

/// Requests accepted by the configuration-distribution endpoint.
///
/// A bare identity (JSON string, or plain text) asks for the node's
/// localconf; a heartbeat object reports liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlRequest {
    Identity(String),
    Heartbeat { heartbeat: Heartbeat },
}

impl ControlRequest {
    pub fn decode(body: &[u8]) -> Option<Self> {
        if let Ok(request) = serde_json::from_slice::<ControlRequest>(body) {
            return Some(request);
        }
        let text = std::str::from_utf8(body).ok()?.trim();
        if text.is_empty() || text.starts_with('{') || text.starts_with('[') {
            return None;
        }
        Some(ControlRequest::Identity(text.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Done,
    Failed,
}

/// A job as received by a worker from the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedJob {
    pub jobid: JobId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Result pushed by a worker to the sink endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkMessage {
    pub jobid: JobId,
    #[serde(default)]
    pub status: Outcome,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Decode a job-intake body into the jobs it describes, in order.
///
/// A bare object is a single job and an array is a batch. A batch is only
/// accepted if every element is a valid description.
pub fn parse_submission(body: &[u8]) -> Result<Vec<Job>, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {}", e))?;

    match value {
        Value::Object(_) => Ok(vec![Job::from_description(value)?]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err("empty job batch".to_string());
            }
            items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    Job::from_description(item).map_err(|e| format!("job {}: {}", index, e))
                })
                .collect()
        }
        _ => Err("submission must be a JSON object or an array of objects".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_shapes() {
        assert_eq!(serde_json::to_value(Ack::queued()).unwrap(), json!({"ans": "Job queued"}));
        assert_eq!(
            serde_json::to_value(Ack::error("bad")).unwrap(),
            json!({"ans": "error", "reason": "bad"})
        );
    }

    #[test]
    fn single_submission() {
        let jobs = parse_submission(br#"{"jobid": 42}"#).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, JobId::from(42));
    }

    #[test]
    fn batch_submission_keeps_order() {
        let body = serde_json::to_vec(&json!([
            {"jobid": 3, "data": "c"},
            {"jobid": 1, "data": "a"},
            {"jobid": 2, "data": "b"},
        ]))
        .unwrap();
        let ids: Vec<String> = parse_submission(&body)
            .unwrap()
            .iter()
            .map(|j| j.id.to_string())
            .collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn batch_with_bad_element_is_rejected() {
        let err = parse_submission(br#"[{"jobid": 1}, {"data": 2}]"#).unwrap_err();
        assert!(err.starts_with("job 1:"), "{}", err);
    }

    #[test]
    fn malformed_submissions() {
        assert!(parse_submission(b"not json").is_err());
        assert!(parse_submission(b"42").is_err());
        assert!(parse_submission(b"[]").is_err());
        assert!(parse_submission(br#"["x"]"#).is_err());
    }

    #[test]
    fn control_request_decoding() {
        assert_eq!(
            ControlRequest::decode(br#""10.0.0.5""#),
            Some(ControlRequest::Identity("10.0.0.5".to_string()))
        );
        assert_eq!(
            ControlRequest::decode(b"10.0.0.5:5000\n"),
            Some(ControlRequest::Identity("10.0.0.5:5000".to_string()))
        );
        let hb = ControlRequest::decode(
            br#"{"heartbeat": {"node": "n1", "load": 2, "capacity": 4, "failed_workers": 0}}"#,
        );
        match hb {
            Some(ControlRequest::Heartbeat { heartbeat }) => {
                assert_eq!(heartbeat.node, "n1");
                assert_eq!(heartbeat.health.load, 2);
                assert_eq!(heartbeat.health.capacity, Some(4));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ControlRequest::decode(b"   "), None);
        assert_eq!(ControlRequest::decode(br#"{"other": 1}"#), None);
    }

    #[test]
    fn status_reply_uses_spaced_key() {
        let reply = StatusReply {
            cluster: BTreeMap::new(),
            active_jobs: vec![JobId::from(1)],
            jobs: JobCounts::default(),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert!(value["cluster"].is_object());
        assert_eq!(value["active jobs"], json!([1]));
    }

    #[test]
    fn sink_message_defaults_to_done() {
        let msg: SinkMessage = serde_json::from_value(json!({"jobid": "a"})).unwrap();
        assert_eq!(msg.status, Outcome::Done);
        assert_eq!(msg.result, Value::Null);
    }

    #[test]
    fn streamed_job_flattens_payload() {
        let job: StreamedJob = serde_json::from_value(json!({"jobid": 9, "text": "hi"})).unwrap();
        assert_eq!(job.jobid, JobId::from(9));
        assert_eq!(job.payload.get("text"), Some(&json!("hi")));
    }
}
