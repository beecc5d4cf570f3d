use crate::catalog::ItemFilter;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, respond, services, with_busy_retry,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{PurchaseStatus, ShopCategory, ShopItem};
use serde_json::{json, Value};

fn items_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let category = match get_optional_str(params, "category")? {
        Some(raw) => Some(
            ShopCategory::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown category: {}", raw)))?,
        ),
        None => None,
    };
    let filter = ItemFilter {
        category,
        available_only: get_optional_bool(params, "availableOnly")?.unwrap_or(false),
    };
    let items = svc.catalog.list_items(&filter)?;
    let items: Vec<Value> = items
        .into_iter()
        .map(|item| {
            let popular = item.is_popular();
            let in_stock = item.in_stock();
            let mut v = json!(item);
            v["popular"] = Value::Bool(popular);
            v["inStock"] = Value::Bool(in_stock);
            v
        })
        .collect();
    Ok(json!({ "items": items }))
}

fn items_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let raw = params
        .get("item")
        .ok_or_else(|| HandlerErr::bad_params("missing item"))?;
    let item: ShopItem = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid item: {}", e)))?;
    let item = with_busy_retry(&svc.config.locking, "shop.items.upsert", || {
        svc.catalog.upsert_item(item.clone())
    })?;
    Ok(json!({ "item": item }))
}

fn purchase(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let item_id = get_required_str(params, "itemId")?;
    let receipt = with_busy_retry(&svc.config.locking, "shop.purchase", || {
        svc.redemption.purchase(&student_id, &item_id)
    })?;
    Ok(json!({ "purchase": receipt.purchase, "balance": receipt.balance }))
}

fn purchases_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let purchases = svc.redemption.purchases_for(&student_id)?;
    Ok(json!({ "purchases": purchases }))
}

fn purchases_advance(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let purchase_id = get_required_str(params, "purchaseId")?;
    let raw = get_required_str(params, "status")?;
    let status = PurchaseStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?;
    let purchase = with_busy_retry(&svc.config.locking, "shop.purchases.advance", || {
        svc.redemption.advance_status(&purchase_id, status)
    })?;
    Ok(json!({ "purchase": purchase }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "shop.items.list" => items_list(state, &req.params),
        "shop.items.upsert" => items_upsert(state, &req.params),
        "shop.purchase" => purchase(state, &req.params),
        "shop.purchases.list" => purchases_list(state, &req.params),
        "shop.purchases.advance" => purchases_advance(state, &req.params),
        _ => return None,
    };
    Some(respond(req, result))
}
