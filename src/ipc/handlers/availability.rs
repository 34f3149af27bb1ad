use crate::availability;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_id, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::TimetableSettings;
use crate::store::{AvailabilityStore, SettingsProvider, SqliteStore};
use rusqlite::Connection;
use serde_json::json;

fn settings(store: &SqliteStore<'_>) -> Result<Option<TimetableSettings>, HandlerErr> {
    store.timetable_settings().map_err(|e| HandlerErr::query_failed(format!("{:#}", e)))
}

fn teachers_bookings(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_id(params, "teacherId")?;
    let store = SqliteStore::new(conn);
    let mut bookings = store
        .teacher_bookings(&teacher_id)
        .map_err(|e| HandlerErr::query_failed(format!("{:#}", e)))?;
    if let Some(s) = settings(&store)? {
        availability::sort_bookings(&mut bookings, &s);
    }
    Ok(json!({ "teacherId": teacher_id, "bookings": bookings }))
}

fn teachers_free_slots(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_id(params, "teacherId")?;
    let store = SqliteStore::new(conn);
    let Some(s) = settings(&store)?.filter(|s| s.is_bounded()) else {
        return Err(HandlerErr::new(
            "context_load_failed",
            "timetable settings have not been configured",
        ));
    };
    let bookings = store
        .teacher_bookings(&teacher_id)
        .map_err(|e| HandlerErr::query_failed(format!("{:#}", e)))?;
    let free: Vec<serde_json::Value> = availability::free_slots(&bookings, &s)
        .into_iter()
        .map(|(day, period)| json!({ "day": day, "period": period }))
        .collect();
    Ok(json!({ "teacherId": teacher_id, "freeSlots": free }))
}

fn handle_teachers_bookings(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match teachers_bookings(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_teachers_free_slots(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match teachers_free_slots(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.bookings" => Some(handle_teachers_bookings(state, req)),
        "teachers.freeSlots" => Some(handle_teachers_free_slots(state, req)),
        _ => None,
    }
}
