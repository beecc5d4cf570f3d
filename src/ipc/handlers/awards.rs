use crate::award::Submission;
use crate::ipc::helpers::{
    get_optional_str, get_required_i64, get_required_str, get_required_timestamp, respond,
    services, with_busy_retry, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::SourceKind;
use serde_json::{json, Value};

fn grade_posted(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let grade_id = get_required_str(params, "gradeId")?;
    let value = get_required_i64(params, "value")?;
    let outcome = with_busy_retry(&svc.config.locking, "awards.gradePosted", || {
        svc.awards.on_grade_posted(&student_id, &grade_id, value)
    })?;
    Ok(json!({ "outcome": outcome }))
}

fn homework_submitted(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let homework_id = get_required_str(params, "homeworkId")?;
    let submission = Submission {
        submitted_at: get_required_timestamp(params, "submittedAt")?,
        deadline: get_required_timestamp(params, "deadline")?,
    };
    let outcome = with_busy_retry(&svc.config.locking, "awards.homeworkSubmitted", || {
        svc.awards
            .on_homework_submitted(&student_id, &homework_id, submission)
    })?;
    Ok(json!({ "outcome": outcome }))
}

fn attendance_streak(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let streak = get_required_i64(params, "streakLength")?;
    let streak = u32::try_from(streak)
        .map_err(|_| HandlerErr::bad_params("streakLength must be a non-negative integer"))?;
    let outcomes = with_busy_retry(&svc.config.locking, "awards.attendanceStreak", || {
        svc.awards.on_attendance_streak(&student_id, streak)
    })?;
    Ok(json!({ "outcomes": outcomes }))
}

fn reverse(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let kind_raw = get_required_str(params, "sourceKind")?;
    let kind = SourceKind::parse(&kind_raw)
        .filter(|k| *k != SourceKind::Redemption)
        .ok_or_else(|| HandlerErr::bad_params(format!("cannot reverse source kind {}", kind_raw)))?;
    let event_id = get_required_str(params, "sourceEventId")?;
    let reason = get_optional_str(params, "reason")?.unwrap_or_default();
    let transaction = with_busy_retry(&svc.config.locking, "awards.reverse", || {
        svc.ledger.reverse(&student_id, kind, &event_id, &reason)
    })?;
    Ok(json!({ "transaction": transaction }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "awards.gradePosted" => grade_posted(state, &req.params),
        "awards.homeworkSubmitted" => homework_submitted(state, &req.params),
        "awards.attendanceStreak" => attendance_streak(state, &req.params),
        "awards.reverse" => reverse(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
