use crate::config::LockingRules;
use crate::error::{LedgerError, LedgerResult};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::service::Services;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

impl From<LedgerError> for HandlerErr {
    fn from(e: LedgerError) -> Self {
        let details = match &e {
            LedgerError::InsufficientBalance { balance, required } => {
                Some(json!({ "balance": balance, "required": required }))
            }
            LedgerError::OutOfStock { item_id } => Some(json!({ "itemId": item_id })),
            LedgerError::NotFound { kind, id } => Some(json!({ "kind": kind, "id": id })),
            LedgerError::InvalidTransition { from, to } => Some(json!({ "from": from, "to": to })),
            _ => None,
        };
        Self {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

/// Serializes a handler result into a response envelope.
pub fn respond<T: Serialize>(req: &Request, result: Result<T, HandlerErr>) -> Value {
    match result.and_then(|v| {
        serde_json::to_value(v).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
    }) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn services(state: &AppState) -> Result<&Services, HandlerErr> {
    state.services.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".into(),
        details: None,
    })
}

/// Runs `op`, retrying `Busy` with doubling backoff before giving up.
pub fn with_busy_retry<T>(
    rules: &LockingRules,
    method: &str,
    mut op: impl FnMut() -> LedgerResult<T>,
) -> Result<T, HandlerErr> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(LedgerError::Busy) if attempt < rules.busy_retries => {
                let wait = rules.backoff(attempt);
                tracing::warn!(method, attempt, wait_ms = wait.as_millis() as u64, "busy, retrying");
                std::thread::sleep(wait);
                attempt += 1;
            }
            other => return other.map_err(HandlerErr::from),
        }
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing integer {}", key)))
}

pub fn get_optional_usize(params: &Value, key: &str) -> Result<Option<usize>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_required_timestamp(params: &Value, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    let raw = get_required_str(params, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp: {}", key, e)))
}
