//! Stratum JSON-RPC framing.
//!
//! Requests go out as one JSON object per line. Incoming lines decode into
//! [`StratumMessage`]; anything that is neither a reply nor a subscription
//! notification is a protocol error.

use serde_json::{json, Value};

pub const METHOD_VERSION: &str = "server.version";
pub const METHOD_PING: &str = "server.ping";
pub const METHOD_HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
pub const METHOD_SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_GET_HISTORY: &str = "blockchain.scripthash.get_history";
pub const METHOD_LIST_UNSPENT: &str = "blockchain.scripthash.listunspent";
pub const METHOD_TRANSACTION_GET: &str = "blockchain.transaction.get";
pub const METHOD_TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
pub const METHOD_BLOCK_HEADER: &str = "blockchain.block.header";

/// Error object of a JSON-RPC reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: Option<i64>,
    pub message: String,
}

impl RpcError {
    /// Broadcast rejections from malicious servers tend to push "security
    /// upgrades" or images at the user.
    pub fn is_spam(&self) -> bool {
        is_spam_text(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StratumMessage {
    Reply {
        id: u64,
        result: Result<Value, RpcError>,
    },
    HeightNotification(u32),
    ScriptHashNotification {
        script_hash: String,
        status: Option<String>,
    },
    /// Some other `*.subscribe` notification. Accepted and ignored.
    OtherNotification(String),
}

pub fn is_spam_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["security", "upgrade", "image"]
        .iter()
        .any(|word| lower.contains(word))
}

pub fn encode_request(id: u64, method: &str, params: &[Value]) -> String {
    let mut line = json!({
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string();
    line.push('\n');
    line
}

pub fn decode_message(line: &str) -> Result<StratumMessage, String> {
    let msg: Value =
        serde_json::from_str(line).map_err(|e| format!("bad json ({}): {}", e, line.trim()))?;

    if !msg.is_object() {
        return Err(format!("not an object: {}", line.trim()));
    }

    if let Some(id) = msg.get("id").filter(|id| !id.is_null()) {
        let id = id
            .as_u64()
            .ok_or_else(|| format!("non-numeric id in {}", line.trim()))?;

        let result = match msg.get("error").filter(|e| !e.is_null()) {
            Some(error) => Err(decode_rpc_error(error)),
            None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Ok(StratumMessage::Reply { id, result });
    }

    let method = msg
        .get("method")
        .and_then(|m| m.as_str())
        .ok_or_else(|| format!("neither reply nor notification: {}", line.trim()))?;
    let params = msg.get("params").and_then(|p| p.as_array());

    match method {
        METHOD_HEADERS_SUBSCRIBE => {
            let header = params
                .and_then(|p| p.first())
                .ok_or_else(|| format!("bad header notification: {}", line.trim()))?;
            notified_height(header)
                .map(StratumMessage::HeightNotification)
                .ok_or_else(|| format!("bad header notification: {}", line.trim()))
        }
        METHOD_SCRIPTHASH_SUBSCRIBE => {
            let script_hash = params
                .and_then(|p| p.first())
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("bad scripthash notification: {}", line.trim()))?;
            let status = params
                .and_then(|p| p.get(1))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Ok(StratumMessage::ScriptHashNotification {
                script_hash: script_hash.to_string(),
                status,
            })
        }
        other if other.ends_with("subscribe") => {
            Ok(StratumMessage::OtherNotification(other.to_string()))
        }
        other => Err(format!("unexpected method {}", other)),
    }
}

/// Height field of a header notification or `blockchain.headers.subscribe`
/// reply. Older servers call it `block_height`.
pub fn notified_height(header: &Value) -> Option<u32> {
    header
        .get("height")
        .or_else(|| header.get("block_height"))
        .and_then(|h| h.as_u64())
        .and_then(|h| u32::try_from(h).ok())
}

fn decode_rpc_error(error: &Value) -> RpcError {
    match error {
        Value::String(s) => RpcError {
            code: None,
            message: first_line(s),
        },
        Value::Object(obj) => {
            let code = obj.get("code").and_then(|c| c.as_i64());
            let message = obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(first_line)
                .or_else(|| code.map(|c| c.to_string()))
                .unwrap_or_else(|| error.to_string());
            RpcError { code, message }
        }
        other => RpcError {
            code: None,
            message: other.to_string(),
        },
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_one_line() {
        let line = encode_request(7, METHOD_GET_HISTORY, &[json!("abcd")]);

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], METHOD_GET_HISTORY);
        assert_eq!(v["params"], json!(["abcd"]));
    }

    #[test]
    fn decodes_replies() {
        let ok = decode_message(r#"{"jsonrpc":"2.0","id":3,"result":[1,2]}"#).unwrap();
        assert_eq!(
            ok,
            StratumMessage::Reply {
                id: 3,
                result: Ok(json!([1, 2]))
            }
        );

        let err = decode_message(
            r#"{"id":4,"error":{"code":-5,"message":"No such mempool transaction\nmore"}}"#,
        )
        .unwrap();
        assert_eq!(
            err,
            StratumMessage::Reply {
                id: 4,
                result: Err(RpcError {
                    code: Some(-5),
                    message: "No such mempool transaction".into()
                })
            }
        );

        let null_result = decode_message(r#"{"id":5,"result":null,"error":null}"#).unwrap();
        assert_eq!(
            null_result,
            StratumMessage::Reply {
                id: 5,
                result: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn decodes_notifications() {
        assert_eq!(
            decode_message(
                r#"{"method":"blockchain.headers.subscribe","params":[{"height":800000,"hex":"00"}]}"#
            )
            .unwrap(),
            StratumMessage::HeightNotification(800000)
        );
        assert_eq!(
            decode_message(
                r#"{"method":"blockchain.headers.subscribe","params":[{"block_height":12}]}"#
            )
            .unwrap(),
            StratumMessage::HeightNotification(12)
        );
        assert_eq!(
            decode_message(
                r#"{"method":"blockchain.scripthash.subscribe","params":["aa","bb"]}"#
            )
            .unwrap(),
            StratumMessage::ScriptHashNotification {
                script_hash: "aa".into(),
                status: Some("bb".into())
            }
        );
        assert_eq!(
            decode_message(
                r#"{"method":"blockchain.scripthash.subscribe","params":["aa",null]}"#
            )
            .unwrap(),
            StratumMessage::ScriptHashNotification {
                script_hash: "aa".into(),
                status: None
            }
        );
        assert_eq!(
            decode_message(r#"{"method":"blockchain.numblocks.subscribe","params":[5]}"#).unwrap(),
            StratumMessage::OtherNotification("blockchain.numblocks.subscribe".into())
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(decode_message("not json").is_err());
        assert!(decode_message("[1,2]").is_err());
        assert!(decode_message(r#"{"id":"x","result":1}"#).is_err());
        assert!(decode_message(r#"{"method":"server.banner","params":[]}"#).is_err());
        assert!(decode_message(r#"{"method":"blockchain.headers.subscribe","params":[{}]}"#).is_err());
        assert!(decode_message(r#"{"result":1}"#).is_err());
    }

    #[test]
    fn spam_heuristic_is_case_insensitive() {
        assert!(is_spam_text("Please UPGRADE your wallet"));
        assert!(is_spam_text("<img> image attached"));
        assert!(is_spam_text("Security alert"));
        assert!(!is_spam_text("min relay fee not met"));
    }
}
