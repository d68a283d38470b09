//! The IPC wire format.
//!
//! Every message is one JSON object per line of the form
//! `{"type": <int>, "data": <object>}`. Four message kinds exist; paths
//! carried in messages are always absolute. A worker answers exactly one
//! `BUILD_RESULT` per `BUILD_REQUEST`, in request order.

use std::path::PathBuf;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Engine asks the worker for its protocol version. Empty payload.
pub const MSG_VERSION_QUERY: u8 = 0;
/// Worker reports its protocol version.
pub const MSG_VERSION_DATA: u8 = 1;
/// Engine requests one build.
pub const MSG_BUILD_REQUEST: u8 = 2;
/// Worker reports one build outcome.
pub const MSG_BUILD_RESULT: u8 = 3;

/// Version assumed for a worker that has not answered a
/// [`Message::VersionQuery`] yet.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

/// One IPC message, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Engine to worker, payload-less version query.
    VersionQuery,
    /// Worker to engine, version answer.
    VersionData(VersionData),
    /// Engine to worker, build request.
    BuildRequest(BuildRequest),
    /// Worker to engine, build outcome.
    BuildResult(BuildResult),
}

/// Payload of [`Message::VersionData`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionData {
    /// Protocol version spoken by the worker.
    pub version: u32,
}

/// Payload of [`Message::BuildRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Absolute path of the source file to compile.
    pub source_path: PathBuf,
    /// Absolute output stem the worker derives its output names from.
    pub target_path: PathBuf,
    /// Platform the output is built for.
    pub platform: String,
}

/// Payload of [`Message::BuildResult`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// Echo of the request's source path.
    pub source_path: PathBuf,
    /// Echo of the request's target path.
    pub target_path: PathBuf,
    /// Echo of the request's platform.
    pub platform: String,
    /// Whether compilation succeeded.
    pub success: bool,
    /// Worker-reported error strings; empty on success.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Absolute paths of the produced files; the first is the primary
    /// output.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Absolute paths of files the source was found to reference.
    #[serde(default)]
    pub references: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    data: serde_json::Value,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as _;
        let frame = match self {
            Self::VersionQuery => Frame {
                kind: MSG_VERSION_QUERY,
                data: serde_json::Value::Object(serde_json::Map::new()),
            },
            Self::VersionData(data) => Frame {
                kind: MSG_VERSION_DATA,
                data: serde_json::to_value(data).map_err(S::Error::custom)?,
            },
            Self::BuildRequest(data) => Frame {
                kind: MSG_BUILD_REQUEST,
                data: serde_json::to_value(data).map_err(S::Error::custom)?,
            },
            Self::BuildResult(data) => Frame {
                kind: MSG_BUILD_RESULT,
                data: serde_json::to_value(data).map_err(S::Error::custom)?,
            },
        };
        frame.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let frame = Frame::deserialize(deserializer)?;
        match frame.kind {
            MSG_VERSION_QUERY => Ok(Self::VersionQuery),
            MSG_VERSION_DATA => serde_json::from_value(frame.data)
                .map(Self::VersionData)
                .map_err(D::Error::custom),
            MSG_BUILD_REQUEST => serde_json::from_value(frame.data)
                .map(Self::BuildRequest)
                .map_err(D::Error::custom),
            MSG_BUILD_RESULT => serde_json::from_value(frame.data)
                .map(Self::BuildResult)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("unknown message type {other}"))),
        }
    }
}

impl Message {
    /// Serializes the message as one line of JSON, without the newline.
    pub fn to_line(&self) -> String {
        // messages contain nothing a JSON serializer can reject.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses one received line.
    pub fn from_line(line: &str) -> Result<Self, crate::Error> {
        serde_json::from_str(line).map_err(crate::Error::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{BuildRequest, BuildResult, Message, VersionData};

    #[test]
    fn version_query_wire_shape() {
        assert_eq!(Message::VersionQuery.to_line(), r#"{"type":0,"data":{}}"#);
    }

    #[test]
    fn build_request_round_trip() {
        let message = Message::BuildRequest(BuildRequest {
            source_path: PathBuf::from("/proj/packages/pkg.source/a.txt"),
            target_path: PathBuf::from("/proj/packages/pkg.generic.target/1a2b3c"),
            platform: "generic".to_owned(),
        });
        let parsed = Message::from_line(&message.to_line()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn build_result_defaults_optional_lists() {
        let line = r#"{"type":3,"data":{"sourcePath":"/s","targetPath":"/t","platform":"ps3","success":false,"errors":["boom"]}}"#;
        let Message::BuildResult(result) = Message::from_line(line).unwrap() else {
            panic!("expected a build result");
        };
        assert!(!result.success);
        assert_eq!(result.errors, vec!["boom"]);
        assert!(result.outputs.is_empty());
        assert!(result.references.is_empty());
    }

    #[test]
    fn version_data_round_trip() {
        let message = Message::VersionData(VersionData { version: 7 });
        assert_eq!(Message::from_line(&message.to_line()).unwrap(), message);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Message::from_line(r#"{"type":9,"data":{}}"#).is_err());
        assert!(Message::from_line("not json").is_err());
    }

    #[test]
    fn build_result_success_round_trip() {
        let message = Message::BuildResult(BuildResult {
            source_path: PathBuf::from("/s"),
            target_path: PathBuf::from("/t"),
            platform: "generic".to_owned(),
            success: true,
            errors: vec![],
            outputs: vec![PathBuf::from("/t.bin")],
            references: vec![PathBuf::from("/s.inc")],
        });
        assert_eq!(Message::from_line(&message.to_line()).unwrap(), message);
    }
}
