//! Wire types shared across clustd components.
//!
//! Every frame on a secure channel decrypts to exactly one [`WireMessage`]:
//! a handshake hello, an RPC request, or an RPC response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClustdError;

/// Kind of participant on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Another clustd node
    Cluster,
    /// An external process that follows mastership changes
    Driver,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Driver => "driver",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext of the encrypted `metadata` header sent when dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMeta {
    #[serde(rename = "type")]
    pub kind: PeerKind,
}

/// Handshake message exchanged once by each side of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Session ticket offered by the sender
    pub hello_world: u32,

    /// Sender's cluster id
    #[serde(default)]
    pub id: String,

    /// Address other nodes should dial to reach the sender
    #[serde(default)]
    pub remote_address: String,
}

/// RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub req_id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
}

/// RPC response, carrying either `data` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub res_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn data(res_id: u64, data: Value) -> Self {
        Self {
            res_id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(res_id: u64, error: impl Into<String>) -> Self {
        Self {
            res_id,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Convert into the outcome seen by the requester
    pub fn into_result(self) -> Result<Value, ClustdError> {
        match self.error {
            Some(err) => Err(ClustdError::Remote(err)),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Any decrypted channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Hello(Hello),
    Request(Request),
    Response(Response),
    /// Valid JSON matching none of the above; dropped by receivers
    Unknown(Value),
}

impl WireMessage {
    pub fn from_value(value: Value) -> Result<Self, ClustdError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Reply to `get_master`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterView {
    #[serde(default)]
    pub master: Option<String>,
}

/// Single parameter of a driver `trigger` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerParams {
    #[serde(rename = "isMaster")]
    pub is_master: bool,
}

/// Outcome of an election, published to notification subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterAssignment {
    /// Id of the elected master
    pub master_id: String,

    /// Whether the elected master is this node
    pub is_local: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classifies_hello() {
        let msg = WireMessage::from_value(json!({
            "hello_world": 42,
            "id": "a",
            "remote_address": "ws://10.0.0.1:7070"
        }))
        .unwrap();

        match msg {
            WireMessage::Hello(hello) => {
                assert_eq!(hello.hello_world, 42);
                assert_eq!(hello.id, "a");
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn test_hello_with_missing_identity_still_classifies() {
        let msg = WireMessage::from_value(json!({ "hello_world": 7 })).unwrap();
        match msg {
            WireMessage::Hello(hello) => assert!(hello.id.is_empty()),
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn test_classifies_request_and_response() {
        let req = WireMessage::from_value(json!({ "req_id": 3, "method": "get_master" })).unwrap();
        assert!(matches!(req, WireMessage::Request(Request { req_id: 3, params: None, .. })));

        let res = WireMessage::from_value(json!({ "res_id": 3, "error": "nope" })).unwrap();
        match res {
            WireMessage::Response(res) => {
                assert_eq!(res.into_result(), Err(ClustdError::Remote("nope".into())));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_message_is_preserved() {
        let msg = WireMessage::from_value(json!({ "foo": 1 })).unwrap();
        assert!(matches!(msg, WireMessage::Unknown(_)));
    }

    #[test]
    fn test_response_without_data_resolves_null() {
        let res = Response {
            res_id: 1,
            data: None,
            error: None,
        };
        assert_eq!(res.into_result(), Ok(Value::Null));
    }

    #[test]
    fn test_metadata_uses_type_key() {
        let meta = ConnectionMeta {
            kind: PeerKind::Driver,
        };
        assert_eq!(serde_json::to_value(meta).unwrap(), json!({ "type": "driver" }));

        let parsed: Result<ConnectionMeta, _> = serde_json::from_value(json!({ "type": "router" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_trigger_params_wire_name() {
        let params = TriggerParams { is_master: true };
        assert_eq!(serde_json::to_value(params).unwrap(), json!({ "isMaster": true }));
    }
}
