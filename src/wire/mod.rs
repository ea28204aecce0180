//! Wire schema for the worker RPC surface.
//!
//! One TCP connection per worker carries every logical stream; envelopes
//! are length-prefixed JSON and `correlation_id` is the multiplexing key.
//! The inference stream is many-to-many: the client sends one or more
//! ordered `RequestFrame`s followed by `close_send`, and reads
//! `ResponseFrame`s until one carries `is_final`.

use std::collections::HashMap;

mod codec;

pub use self::codec::{Codec, ClientCodec, WorkerCodec};

/// One message on the request side of an inference stream.
///
/// For a multi-frame request, `seq` starts at 0 and increases by 1,
/// `offset` is the sum of prior payload lengths, and `total` is constant
/// across all frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub correlation_id: String,
    pub task: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub payload_mime: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// One message on the response side of an inference stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub correlation_id: String,
    #[serde(default)]
    pub result: Vec<u8>,
    #[serde(default)]
    pub result_mime: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// What a worker can do, as reported by the capability RPC.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub precisions: Vec<String>,
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl Capability {
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    pub fn supports(&self, task: &str) -> bool {
        self.tasks.iter().any(|t| t.name == task)
    }
}

/// Client-to-worker envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Frame(RequestFrame),
    CloseSend { correlation_id: String },
    Capabilities { correlation_id: String },
    Health { correlation_id: String },
}

impl ClientEnvelope {
    pub fn correlation_id(&self) -> &str {
        match *self {
            ClientEnvelope::Frame(ref f) => &f.correlation_id,
            ClientEnvelope::CloseSend { ref correlation_id } |
            ClientEnvelope::Capabilities { ref correlation_id } |
            ClientEnvelope::Health { ref correlation_id } => correlation_id,
        }
    }
}

/// Worker-to-client envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEnvelope {
    Frame(ResponseFrame),
    Capabilities {
        correlation_id: String,
        capability: Capability,
    },
    Health { correlation_id: String },
    Error {
        correlation_id: String,
        message: String,
    },
}

impl WorkerEnvelope {
    pub fn correlation_id(&self) -> &str {
        match *self {
            WorkerEnvelope::Frame(ref f) => &f.correlation_id,
            WorkerEnvelope::Capabilities { ref correlation_id, .. } |
            WorkerEnvelope::Health { ref correlation_id } |
            WorkerEnvelope::Error { ref correlation_id, .. } => correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json;
    use super::{ClientEnvelope, RequestFrame, ResponseFrame, WorkerEnvelope};

    #[test]
    /// Field names are the interop contract; workers match on them.
    fn envelope_json_shape_is_stable() {
        let env = ClientEnvelope::Frame(RequestFrame {
            correlation_id: "req-7".into(),
            task: "ocr".into(),
            payload: vec![1],
            payload_mime: "image/png".into(),
            seq: 2,
            total: 3,
            offset: 64,
            meta: Default::default(),
        });
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "frame");
        assert_eq!(json["correlation_id"], "req-7");
        assert_eq!(json["task"], "ocr");
        assert_eq!(json["seq"], 2);
        assert_eq!(json["total"], 3);
        assert_eq!(json["offset"], 64);
        assert_eq!(json["payload_mime"], "image/png");

        let close = serde_json::to_value(&ClientEnvelope::CloseSend {
                correlation_id: "req-7".into(),
            })
            .unwrap();
        assert_eq!(close["kind"], "close_send");
    }

    #[test]
    fn response_frames_decode_with_defaults() {
        let raw = r#"{"kind":"frame","correlation_id":"req-7","is_final":true}"#;
        let env: WorkerEnvelope = serde_json::from_str(raw).unwrap();
        match env {
            WorkerEnvelope::Frame(ResponseFrame { ref correlation_id, ref result, is_final, .. }) => {
                assert_eq!(correlation_id, "req-7");
                assert!(result.is_empty());
                assert!(is_final);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }
}
