//! JSON wire protocol for replication and peer coordination.
//!
//! Wire format (one JSON object per message):
//! ```text
//! {
//!   "version": 1,              protocol version, anything else is BAD_VERSION
//!   "kind":    "op",           closed set, unknown kinds are UNSUPPORTED
//!   "from":    "client-a",     sender id
//!   "to":      null,           null = broadcast
//!   "id":      "…",            message id (length-capped)
//!   "atMs":    1700000000000,  sender wall clock
//!   …                          kind-specific fields, camelCase
//! }
//! ```
//!
//! Inbound text is validated once by [`decode`]; a message either passes
//! every check and becomes a typed [`Envelope`] or is rejected with an
//! [`ErrorCode`]. Nothing downstream sees a partially validated message.

use std::fmt;

use concord_core::ids::new_message_id;
use concord_core::time::now_ms;
use concord_core::{ConcurrencyPolicy, Patch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::divergence::HashAnnouncement;
use crate::upgrade::{UpgradeProposal, UpgradeStatus, UpgradeVote};

/// The only protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Every kind this build understands.
pub const KNOWN_KINDS: [&str; 12] = [
    "hello",
    "snapshot",
    "op",
    "ack",
    "conflict",
    "presence",
    "error",
    "hash_announce",
    "upgrade_propose",
    "upgrade_vote",
    "upgrade_apply",
    "upgrade_status",
];

/// Size and shape limits enforced at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLimits {
    /// Maximum serialized message size in bytes. Default: 512 KiB.
    pub max_message_bytes: usize,
    /// Maximum length of a message id or op id. Default: 128.
    pub max_id_len: usize,
    /// Maximum length of a document id. Default: 128.
    pub max_doc_id_len: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: 512 * 1024,
            max_id_len: 128,
            max_doc_id_len: 128,
        }
    }
}

impl MessageLimits {
    /// Limits for testing (tiny caps so rejection paths are easy to hit).
    pub fn for_testing() -> Self {
        Self {
            max_message_bytes: 4 * 1024,
            max_id_len: 32,
            max_doc_id_len: 32,
        }
    }
}

/// Error codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MsgTooLarge,
    BadMsg,
    NoDoc,
    NoSession,
    NoOpid,
    BadVersion,
    BadPatch,
    VersionMismatch,
    Unsupported,
    /// Client-local: the outbound queue is full.
    QueueFull,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MsgTooLarge => "MSG_TOO_LARGE",
            ErrorCode::BadMsg => "BAD_MSG",
            ErrorCode::NoDoc => "NO_DOC",
            ErrorCode::NoSession => "NO_SESSION",
            ErrorCode::NoOpid => "NO_OPID",
            ErrorCode::BadVersion => "BAD_VERSION",
            ErrorCode::BadPatch => "BAD_PATCH",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::QueueFull => "QUEUE_FULL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason string of the informational conflict sent after a stale
/// `path_set` op was applied under last-write-wins.
pub const LWW_PATHSET_APPLIED: &str = "LWW_PATHSET_APPLIED";

/// Kind-specific message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Subscribe to a document; answered with a full snapshot.
    Hello { doc_id: String },
    Snapshot {
        doc_id: String,
        /// Replica version; named `docVersion` on the wire so it cannot
        /// collide with the envelope's protocol `version`.
        #[serde(rename = "docVersion")]
        version: u64,
        state: Value,
        schema_version: String,
    },
    Op {
        doc_id: String,
        op_id: String,
        base_version: u64,
        patch: Patch,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<ConcurrencyPolicy>,
    },
    Ack {
        doc_id: String,
        op_id: String,
        new_version: u64,
    },
    Conflict {
        doc_id: String,
        op_id: String,
        applied: bool,
        reason: String,
        server_version: u64,
    },
    Presence {
        doc_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_id: Option<String>,
    },
    HashAnnounce(HashAnnouncement),
    UpgradePropose(UpgradeProposal),
    UpgradeVote(UpgradeVote),
    UpgradeApply { proposal_id: String, plan_id: String },
    UpgradeStatus(UpgradeStatus),
}

impl Message {
    /// Wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Snapshot { .. } => "snapshot",
            Message::Op { .. } => "op",
            Message::Ack { .. } => "ack",
            Message::Conflict { .. } => "conflict",
            Message::Presence { .. } => "presence",
            Message::Error { .. } => "error",
            Message::HashAnnounce(_) => "hash_announce",
            Message::UpgradePropose(_) => "upgrade_propose",
            Message::UpgradeVote(_) => "upgrade_vote",
            Message::UpgradeApply { .. } => "upgrade_apply",
            Message::UpgradeStatus(_) => "upgrade_status",
        }
    }

    /// Document this message is about, if any.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Message::Hello { doc_id }
            | Message::Snapshot { doc_id, .. }
            | Message::Op { doc_id, .. }
            | Message::Ack { doc_id, .. }
            | Message::Conflict { doc_id, .. }
            | Message::Presence { doc_id, .. } => Some(doc_id),
            _ => None,
        }
    }
}

/// A message plus its routing header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub id: String,
    pub at_ms: u64,
    #[serde(flatten)]
    pub body: Message,
}

impl Envelope {
    /// New broadcast envelope stamped with a fresh id and the current time.
    pub fn new(from: impl Into<String>, body: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            from: from.into(),
            to: None,
            id: new_message_id(),
            at_ms: now_ms(),
            body,
        }
    }

    /// Address this envelope to a single peer.
    pub fn to(mut self, peer: impl Into<String>) -> Self {
        self.to = Some(peer.into());
        self
    }

    /// Convenience constructor for `error` replies.
    pub fn error(
        from: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        op_id: Option<String>,
    ) -> Self {
        Self::new(
            from,
            Message::Error {
                code,
                message: message.into(),
                op_id,
            },
        )
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// True if this envelope should be delivered to `peer`.
    pub fn is_for(&self, peer: &str) -> bool {
        self.to.as_deref().map_or(true, |to| to == peer)
    }

    /// Serialize, refusing to produce anything over the size cap.
    pub fn encode(&self, limits: &MessageLimits) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(self)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if text.len() > limits.max_message_bytes {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: limits.max_message_bytes,
            });
        }
        Ok(text)
    }
}

/// Protocol-boundary errors. Each maps onto one wire [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("message is {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}")]
    BadVersion(String),
    #[error("unsupported message kind '{0}'")]
    Unsupported(String),
    #[error("op carries no opId")]
    NoOpId,
    #[error("missing or invalid docId")]
    NoDoc,
    #[error("invalid patch: {0}")]
    BadPatch(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::TooLarge { .. } => ErrorCode::MsgTooLarge,
            ProtocolError::Malformed(_) | ProtocolError::Serialization(_) => ErrorCode::BadMsg,
            ProtocolError::BadVersion(_) => ErrorCode::BadVersion,
            ProtocolError::Unsupported(_) => ErrorCode::Unsupported,
            ProtocolError::NoOpId => ErrorCode::NoOpid,
            ProtocolError::NoDoc => ErrorCode::NoDoc,
            ProtocolError::BadPatch(_) => ErrorCode::BadPatch,
        }
    }
}

fn valid_doc_id(doc_id: &str, limits: &MessageLimits) -> bool {
    !doc_id.is_empty()
        && doc_id.len() <= limits.max_doc_id_len
        && doc_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':'))
}

fn required_str<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing '{field}'")))
}

/// Validate and decode one inbound message.
pub fn decode(raw: &str, limits: &MessageLimits) -> Result<Envelope, ProtocolError> {
    if raw.len() > limits.max_message_bytes {
        return Err(ProtocolError::TooLarge {
            size: raw.len(),
            max: limits.max_message_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("message is not an object".into()))?;

    match obj.get("version") {
        None => return Err(ProtocolError::Malformed("missing 'version'".into())),
        Some(v) if v.as_u64() == Some(PROTOCOL_VERSION as u64) => {}
        Some(v) => return Err(ProtocolError::BadVersion(v.to_string())),
    }

    let kind = required_str(obj, "kind")?;
    if !KNOWN_KINDS.contains(&kind) {
        return Err(ProtocolError::Unsupported(kind.to_string()));
    }
    required_str(obj, "from")?;
    let id = required_str(obj, "id")?;
    if id.is_empty() || id.len() > limits.max_id_len {
        return Err(ProtocolError::Malformed(format!(
            "id length {} outside 1..={}",
            id.len(),
            limits.max_id_len
        )));
    }
    if obj.get("atMs").and_then(Value::as_u64).is_none() {
        return Err(ProtocolError::Malformed("missing 'atMs'".into()));
    }

    if matches!(kind, "hello" | "snapshot" | "op" | "ack" | "conflict" | "presence") {
        let doc_ok = obj
            .get("docId")
            .and_then(Value::as_str)
            .is_some_and(|d| valid_doc_id(d, limits));
        if !doc_ok {
            return Err(ProtocolError::NoDoc);
        }
    }

    if kind == "op" {
        let op_id = obj.get("opId").and_then(Value::as_str).unwrap_or("");
        if op_id.is_empty() {
            return Err(ProtocolError::NoOpId);
        }
        if op_id.len() > limits.max_id_len {
            return Err(ProtocolError::Malformed("opId too long".into()));
        }
        let patch_value = obj
            .get("patch")
            .ok_or_else(|| ProtocolError::BadPatch("missing 'patch'".into()))?;
        let patch: Patch = serde_json::from_value(patch_value.clone())
            .map_err(|e| ProtocolError::BadPatch(e.to_string()))?;
        patch
            .validate()
            .map_err(|e| ProtocolError::BadPatch(e.to_string()))?;
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::PathOp;
    use serde_json::json;

    fn op_envelope() -> Envelope {
        Envelope::new(
            "client-a",
            Message::Op {
                doc_id: "doc-1".into(),
                op_id: "op-1".into(),
                base_version: 3,
                patch: Patch::path_set(vec![PathOp::new("a.b", json!(1))]),
                policy: Some(ConcurrencyPolicy::LwwPathset),
            },
        )
    }

    #[test]
    fn test_op_roundtrip_and_header() {
        let limits = MessageLimits::default();
        let env = op_envelope();
        let text = env.encode(&limits).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["version"], json!(1));
        assert_eq!(raw["kind"], json!("op"));
        assert_eq!(raw["to"], Value::Null);
        assert_eq!(raw["baseVersion"], json!(3));
        assert_eq!(raw["patch"]["type"], json!("path_set"));
        assert_eq!(decode(&text, &limits).unwrap(), env);
    }

    #[test]
    fn test_rejects_oversized() {
        let limits = MessageLimits::for_testing();
        let env = Envelope::new(
            "a",
            Message::Snapshot {
                doc_id: "d".into(),
                version: 0,
                state: json!("x".repeat(8 * 1024)),
                schema_version: "1".into(),
            },
        );
        assert!(matches!(env.encode(&limits), Err(ProtocolError::TooLarge { .. })));
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(decode(&text, &limits).unwrap_err().code(), ErrorCode::MsgTooLarge);
    }

    #[test]
    fn test_rejects_bad_version_and_unknown_kind() {
        let limits = MessageLimits::default();
        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["version"] = json!(2);
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::BadVersion);

        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["kind"] = json!("teleport");
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::Unsupported);
    }

    #[test]
    fn test_rejects_missing_fields() {
        let limits = MessageLimits::default();
        for field in ["from", "id", "atMs", "version", "kind"] {
            let mut raw = serde_json::to_value(op_envelope()).unwrap();
            raw.as_object_mut().unwrap().remove(field);
            let err = decode(&raw.to_string(), &limits).unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadMsg, "field {field}");
        }
        assert_eq!(decode("not json", &limits).unwrap_err().code(), ErrorCode::BadMsg);
        assert_eq!(decode("[1,2]", &limits).unwrap_err().code(), ErrorCode::BadMsg);
    }

    #[test]
    fn test_rejects_long_id() {
        let limits = MessageLimits::for_testing();
        let mut env = op_envelope();
        env.id = "x".repeat(limits.max_id_len + 1);
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(decode(&text, &limits).unwrap_err().code(), ErrorCode::BadMsg);
    }

    #[test]
    fn test_op_specific_codes() {
        let limits = MessageLimits::default();

        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["opId"] = json!("");
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::NoOpid);

        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["patch"] = json!({"type": "merge", "value": [1]});
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::BadPatch);

        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["patch"] = json!({"type": "path_set", "ops": [{"path": "a.__proto__", "value": 1}]});
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::BadPatch);

        let mut raw = serde_json::to_value(op_envelope()).unwrap();
        raw["docId"] = json!("has.dots");
        assert_eq!(decode(&raw.to_string(), &limits).unwrap_err().code(), ErrorCode::NoDoc);
    }

    #[test]
    fn test_snapshot_version_does_not_clash() {
        let limits = MessageLimits::default();
        let env = Envelope::new(
            "server",
            Message::Snapshot {
                doc_id: "d".into(),
                version: 7,
                state: json!({}),
                schema_version: "1".into(),
            },
        );
        let text = env.encode(&limits).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["version"], json!(1));
        assert_eq!(raw["docVersion"], json!(7));
        assert_eq!(decode(&text, &limits).unwrap(), env);
    }

    #[test]
    fn test_addressing() {
        let env = Envelope::new("a", Message::Hello { doc_id: "d".into() });
        assert!(env.is_for("anyone"));
        let env = env.to("b");
        assert!(env.is_for("b"));
        assert!(!env.is_for("c"));
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(serde_json::to_value(ErrorCode::VersionMismatch).unwrap(), json!("VERSION_MISMATCH"));
        assert_eq!(serde_json::to_value(ErrorCode::NoOpid).unwrap(), json!("NO_OPID"));
        assert_eq!(ErrorCode::MsgTooLarge.to_string(), "MSG_TOO_LARGE");
    }
}
