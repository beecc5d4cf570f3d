use crate::ipc::helpers::{
    get_optional_str, get_optional_usize, get_required_i64, get_required_str, respond, services,
    with_busy_retry, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Page, SourceKind, TransactionInput};
use serde_json::{json, Value};

const DEFAULT_TOP: usize = 10;

fn balance(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let account = svc.ledger.account(&student_id)?;
    Ok(json!({ "account": account }))
}

fn history(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let limit = get_optional_usize(params, "limit")?.unwrap_or(Page::DEFAULT_LIMIT);
    if limit == 0 {
        return Err(HandlerErr::bad_params("limit must be at least 1"));
    }
    let page = Page::new(get_optional_usize(params, "offset")?.unwrap_or(0), limit);
    let transactions = svc.ledger.history(&student_id, page)?;
    Ok(json!({ "transactions": transactions, "offset": page.offset, "limit": page.limit }))
}

/// Manual staff adjustment. Positive amounts are idempotent per
/// `sourceEventId`; negative ones may not take the balance below zero.
fn adjust(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let input = TransactionInput::new(
        get_required_str(params, "studentId")?,
        SourceKind::ManualAdjustment,
        get_required_str(params, "sourceEventId")?,
        get_required_i64(params, "amount")?,
        get_required_str(params, "description")?,
    );
    let appended = with_busy_retry(&svc.config.locking, "points.adjust", || {
        svc.ledger.append_transaction(input.clone())
    })?;
    Ok(json!({
        "transaction": appended.transaction(),
        "created": appended.is_created(),
    }))
}

fn summary(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let group = get_optional_str(params, "groupId")?;
    let top = get_optional_usize(params, "top")?.unwrap_or(DEFAULT_TOP);
    let summary = svc.ledger.summary(group.as_deref(), top)?;
    Ok(json!({ "summary": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "points.balance" => balance(state, &req.params),
        "points.history" => history(state, &req.params),
        "points.adjust" => adjust(state, &req.params),
        "points.summary" => summary(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
