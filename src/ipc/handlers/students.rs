use crate::ipc::helpers::{
    get_optional_str, get_required_str, respond, services, with_busy_retry, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::NewStudent;
use serde_json::{json, Value};

fn create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let new = NewStudent {
        id: get_optional_str(params, "id")?,
        name: get_required_str(params, "name")?,
        email: get_optional_str(params, "email")?,
        phone: get_optional_str(params, "phone")?,
        group_id: get_optional_str(params, "groupId")?,
    };
    let student = with_busy_retry(&svc.config.locking, "students.create", || {
        svc.roster.create(new.clone())
    })?;
    Ok(json!({ "studentId": student.id, "student": student }))
}

fn list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let group = get_optional_str(params, "groupId")?;
    let students = svc.roster.list(group.as_deref())?;
    Ok(json!({ "students": students }))
}

fn get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let student = svc.roster.get(&student_id)?;
    Ok(json!({ "student": student }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => create(state, &req.params),
        "students.list" => list(state, &req.params),
        "students.get" => get(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
