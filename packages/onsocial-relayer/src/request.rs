//! Structural validation of inbound forward requests.
//!
//! The relayer never verifies signatures or business rules; the contract is
//! the authority on that. This module only checks that a request has the
//! shape the contract's `execute(request)` expects, so malformed input is
//! rejected before a signing key is taken from the pool.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use near_crypto::PublicKey;
use near_primitives::types::AccountId;
use serde_json::{json, Map, Value};

use crate::error::RelayError;

/// Top-level fields the contract's `Request` accepts.
const REQUEST_FIELDS: [&str; 4] = ["target_account", "action", "auth", "options"];

/// Authentication payload, tagged by `auth.type`.
///
/// Contents are forwarded as-is; only their shape is checked here.
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Direct,
    SignedPayload(SignedPayload),
    DelegateAction {
        signed: SignedPayload,
        action: Value,
    },
    Intent {
        actor_id: AccountId,
        intent: Value,
    },
}

/// Off-chain signature envelope shared by `signed_payload` and
/// `delegate_action`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedPayload {
    pub public_key: PublicKey,
    pub nonce: u64,
    pub expires_at_ms: u64,
    /// Opaque signature bytes. Verified on-chain, never here.
    pub signature: Vec<u8>,
}

impl Auth {
    pub fn mode(&self) -> &'static str {
        match self {
            Auth::Direct => "direct",
            Auth::SignedPayload(_) => "signed_payload",
            Auth::DelegateAction { .. } => "delegate_action",
            Auth::Intent { .. } => "intent",
        }
    }

    /// Wire form expected by the contract (`U64` as string, signature base64).
    pub fn to_json(&self) -> Value {
        match self {
            Auth::Direct => json!({ "type": "direct" }),
            Auth::SignedPayload(signed) => {
                let mut obj = signed.to_json_map();
                obj.insert("type".into(), json!("signed_payload"));
                Value::Object(obj)
            }
            Auth::DelegateAction { signed, action } => {
                let mut obj = signed.to_json_map();
                obj.insert("type".into(), json!("delegate_action"));
                obj.insert("action".into(), action.clone());
                Value::Object(obj)
            }
            Auth::Intent { actor_id, intent } => json!({
                "type": "intent",
                "actor_id": actor_id,
                "intent": intent,
            }),
        }
    }
}

impl SignedPayload {
    fn to_json_map(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("public_key".into(), json!(self.public_key.to_string()));
        obj.insert("nonce".into(), json!(self.nonce.to_string()));
        obj.insert("expires_at_ms".into(), json!(self.expires_at_ms.to_string()));
        obj.insert("signature".into(), json!(B64.encode(&self.signature)));
        obj
    }
}

/// A request that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub target_account: AccountId,
    /// Opaque to the relayer beyond being a JSON object.
    pub action: Value,
    pub auth: Auth,
    pub options: Option<Value>,
}

impl RelayRequest {
    /// `action.type` if present, for logs only.
    pub fn action_type(&self) -> &str {
        self.action
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
    }

    /// The request object in the contract's wire format.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("target_account".into(), json!(self.target_account));
        obj.insert("action".into(), self.action.clone());
        obj.insert("auth".into(), self.auth.to_json());
        if let Some(options) = &self.options {
            obj.insert("options".into(), options.clone());
        }
        Value::Object(obj)
    }

    /// Serialized `{"request": ...}` arguments for the contract call.
    pub fn to_call_args(&self) -> Vec<u8> {
        // Serializing a `Value` built from valid JSON cannot fail.
        serde_json::to_vec(&json!({ "request": self.to_json() })).unwrap_or_default()
    }
}

/// Validate a raw request body. Pure; touches nothing but its input.
pub fn validate(raw: &Value, max_action_bytes: usize) -> Result<RelayRequest, RelayError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| malformed("request must be a JSON object"))?;

    if let Some(unknown) = obj.keys().find(|k| !REQUEST_FIELDS.contains(&k.as_str())) {
        return Err(malformed(format!("unknown field '{unknown}'")));
    }

    let target_account = match obj.get("target_account") {
        None | Some(Value::Null) => return Err(malformed("missing 'target_account'")),
        Some(v) => parse_account(v, "target_account")?,
    };

    let action = match obj.get("action") {
        None | Some(Value::Null) => return Err(malformed("missing 'action'")),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(malformed("'action' must be a JSON object")),
    };

    let size = serde_json::to_vec(&action).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > max_action_bytes {
        return Err(RelayError::PayloadTooLarge {
            size,
            max: max_action_bytes,
        });
    }

    let auth = match obj.get("auth") {
        None | Some(Value::Null) => return Err(malformed("missing 'auth'")),
        Some(v) => parse_auth(v)?,
    };

    let options = match obj.get("options") {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(_) => return Err(malformed("'options' must be a JSON object")),
    };

    Ok(RelayRequest {
        target_account,
        action,
        auth,
        options,
    })
}

fn parse_auth(value: &Value) -> Result<Auth, RelayError> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("'auth' must be a JSON object"))?;

    let mode = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| malformed("'auth.type' is required"))?;

    let allowed: &[&str] = match mode {
        "direct" => &["type"],
        "signed_payload" => &["type", "public_key", "nonce", "expires_at_ms", "signature"],
        "delegate_action" => &[
            "type",
            "public_key",
            "nonce",
            "expires_at_ms",
            "signature",
            "action",
        ],
        "intent" => &["type", "actor_id", "intent"],
        other => return Err(malformed(format!("unrecognized auth type '{other}'"))),
    };
    // Fields from another mode mean the caller mixed two payloads.
    if let Some(extra) = obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(malformed(format!(
            "field 'auth.{extra}' is not valid for auth type '{mode}'"
        )));
    }

    match mode {
        "direct" => Ok(Auth::Direct),
        "signed_payload" => Ok(Auth::SignedPayload(parse_signed(obj)?)),
        "delegate_action" => {
            let signed = parse_signed(obj)?;
            let action = match obj.get("action") {
                None | Some(Value::Null) => {
                    return Err(malformed("'auth.action' is required for delegate_action"))
                }
                Some(v) => v.clone(),
            };
            Ok(Auth::DelegateAction { signed, action })
        }
        _ => {
            let actor_id = match obj.get("actor_id") {
                None | Some(Value::Null) => {
                    return Err(malformed("'auth.actor_id' is required for intent"))
                }
                Some(v) => parse_account(v, "auth.actor_id")?,
            };
            let intent = match obj.get("intent") {
                None | Some(Value::Null) => {
                    return Err(malformed("'auth.intent' is required for intent"))
                }
                Some(v) => v.clone(),
            };
            Ok(Auth::Intent { actor_id, intent })
        }
    }
}

fn parse_signed(obj: &Map<String, Value>) -> Result<SignedPayload, RelayError> {
    let public_key = required_str(obj, "public_key")?
        .parse::<PublicKey>()
        .map_err(|e| malformed(format!("'auth.public_key' is not a valid key: {e}")))?;

    let signature = B64
        .decode(required_str(obj, "signature")?)
        .map_err(|e| malformed(format!("'auth.signature' is not valid base64: {e}")))?;
    if signature.is_empty() {
        return Err(malformed("'auth.signature' must not be empty"));
    }

    Ok(SignedPayload {
        public_key,
        nonce: parse_u64(obj, "nonce")?,
        expires_at_ms: parse_u64(obj, "expires_at_ms")?,
        signature,
    })
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, RelayError> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed(format!("'auth.{field}' must be a string")))
}

/// Accepts the contract's `U64` string form and plain JSON integers.
fn parse_u64(obj: &Map<String, Value>, field: &str) -> Result<u64, RelayError> {
    match obj.get(field) {
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| malformed(format!("'auth.{field}' is not an unsigned integer"))),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| malformed(format!("'auth.{field}' is not an unsigned integer"))),
        _ => Err(malformed(format!("'auth.{field}' is required"))),
    }
}

fn parse_account(value: &Value, field: &str) -> Result<AccountId, RelayError> {
    let s = value
        .as_str()
        .ok_or_else(|| malformed(format!("'{field}' must be a string")))?;
    if s.is_empty() {
        return Err(malformed(format!("'{field}' must not be empty")));
    }
    s.parse()
        .map_err(|e| malformed(format!("'{field}' is not a valid account id: {e}")))
}

fn malformed(msg: impl Into<String>) -> RelayError {
    RelayError::MalformedRequest(msg.into())
}
