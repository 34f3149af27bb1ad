use crate::engine::{CellState, Decision, EditingSession, EngineError, Target};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_bool, get_required_id, get_required_str, get_required_u32, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::ClassSection;
use crate::store::SqliteStore;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

fn engine_err(e: EngineError) -> HandlerErr {
    let message = e.to_string();
    match e {
        EngineError::ContextLoad(_) => HandlerErr::new("context_load_failed", message),
        EngineError::InvalidTarget(_) => HandlerErr::new("invalid_target", message),
        EngineError::UnknownMapping {
            class_section,
            subject_id,
            teacher_id,
        } => HandlerErr::new("unknown_mapping", message).with_details(json!({
            "classId": class_section.class_id,
            "sectionId": class_section.section_id,
            "subjectId": subject_id,
            "teacherId": teacher_id
        })),
        EngineError::NoPendingConflict => HandlerErr::new("no_pending_conflict", message),
        EngineError::InvalidGrid(_) => HandlerErr::new("invalid_grid", message),
        EngineError::PersistConflict {
            teacher_id,
            day,
            period,
            conflicting_class,
        } => HandlerErr::new("persist_conflict", message).with_details(json!({
            "teacherId": teacher_id,
            "day": day,
            "period": period,
            "conflictingClass": conflicting_class
        })),
        EngineError::Adapter(e) => HandlerErr::query_failed(format!("{:#}", e)),
    }
}

fn cell_state_json(cell: &CellState) -> Value {
    match cell {
        CellState::Idle | CellState::Cancelled => json!({ "state": cell.name() }),
        CellState::SelectingMapping { day, period } => {
            json!({ "state": cell.name(), "day": day, "period": period })
        }
        CellState::ConflictDetected(pending) => json!({
            "state": cell.name(),
            "subjectId": pending.entry.subject_id,
            "teacherId": pending.entry.teacher_id,
            "conflict": pending.conflict,
            "inGrid": pending.in_grid
        }),
        CellState::Applied(Target::Cell { day, period }) => {
            json!({ "state": cell.name(), "day": day, "period": period })
        }
        CellState::Applied(Target::AllDays { period }) => {
            json!({ "state": cell.name(), "allDays": true, "period": period })
        }
    }
}

/// Working days in configured order, each with its slots and display names.
fn grid_view(conn: &Connection, session: &EditingSession) -> Result<Value, HandlerErr> {
    let store = SqliteStore::new(conn);
    let subject_names: HashMap<String, String> =
        store.subject_names().map_err(HandlerErr::query_failed)?;
    let teacher_names: HashMap<String, String> =
        store.teacher_names().map_err(HandlerErr::query_failed)?;

    let settings = session.settings();
    let mut days = Vec::with_capacity(settings.working_days.len());
    for day in &settings.working_days {
        let slots: Vec<Value> = session
            .grid()
            .day(day)
            .iter()
            .map(|slot| {
                let entries: Vec<Value> = slot
                    .entries
                    .iter()
                    .map(|e| {
                        json!({
                            "subjectId": e.subject_id,
                            "subjectName": subject_names.get(&e.subject_id),
                            "teacherId": e.teacher_id,
                            "teacherName": teacher_names.get(&e.teacher_id)
                        })
                    })
                    .collect();
                json!({ "period": slot.period, "entries": entries })
            })
            .collect();
        days.push(json!({ "day": day, "slots": slots }));
    }
    // Stored days the current settings no longer schedule are kept, not shown.
    let off_week_days: Vec<&String> = session
        .grid()
        .days()
        .filter(|(day, slots)| !settings.is_working_day(day) && !slots.is_empty())
        .map(|(day, _)| day)
        .collect();

    Ok(json!({
        "classId": session.class_section().class_id,
        "sectionId": session.class_section().section_id,
        "totalPeriods": settings.total_periods,
        "breaks": settings.breaks,
        "days": days,
        "offWeekDays": off_week_days,
        "cellState": cell_state_json(session.cell()),
        "pendingConflict": session.pending_conflict()
    }))
}

/// Adds the cell state and quota usage to an engine outcome.
fn with_session_state(outcome: Value, session: &EditingSession) -> Value {
    let mut body = outcome;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("cellState".to_string(), cell_state_json(session.cell()));
        obj.insert("usage".to_string(), json!(session.usage()));
    }
    body
}

fn timetable_open(
    state: &mut AppState,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let class_section = ClassSection::new(
        get_required_id(params, "classId")?,
        get_required_id(params, "sectionId")?,
    );
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let session =
        EditingSession::load(&SqliteStore::new(conn), class_section.clone()).map_err(engine_err)?;
    let view = grid_view(conn, &session)?;
    let usage = session.usage();
    let session_mappings = json!(session.mappings());
    let revision = session.loaded_revision().map(str::to_string);

    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(session_id.clone(), session);
    log::debug!("session {} opened for {}", session_id, class_section);

    Ok(json!({
        "sessionId": session_id,
        "classId": class_section.class_id,
        "sectionId": class_section.section_id,
        "revision": revision,
        "view": view,
        "mappings": session_mappings,
        "usage": usage
    }))
}

fn timetable_select(session: &mut EditingSession, params: &Value) -> Result<Value, HandlerErr> {
    let day = get_required_id(params, "day")?;
    let period = get_required_u32(params, "period")?;
    session.select(&day, period).map_err(engine_err)?;
    Ok(json!({ "cellState": cell_state_json(session.cell()) }))
}

fn timetable_assign(session: &mut EditingSession, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = get_required_id(params, "subjectId")?;
    let teacher_id = get_required_id(params, "teacherId")?;
    let period = get_required_u32(params, "period")?;
    let target = if get_optional_bool(params, "allDays")? {
        Target::AllDays { period }
    } else {
        Target::Cell {
            day: get_required_id(params, "day")?,
            period,
        }
    };
    let outcome = session
        .assign(&target, &subject_id, &teacher_id)
        .map_err(engine_err)?;
    Ok(with_session_state(json!(outcome), session))
}

fn timetable_resolve_conflict(
    session: &mut EditingSession,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let raw = params
        .get("decision")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing decision"))?;
    let decision: Decision = serde_json::from_value(raw)
        .map_err(|_| HandlerErr::bad_params("decision must be \"cancel\" or \"override\""))?;
    let outcome = session.resolve_conflict(decision).map_err(engine_err)?;
    Ok(with_session_state(json!(outcome), session))
}

fn timetable_remove_entry(
    session: &mut EditingSession,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let day = get_required_id(params, "day")?;
    let period = get_required_u32(params, "period")?;
    let index = get_required_u32(params, "entryIndex")? as usize;
    let outcome = session.remove_entry(&day, period, index);
    Ok(with_session_state(json!(outcome), session))
}

fn timetable_save(conn: &Connection, session: &mut EditingSession) -> Result<Value, HandlerErr> {
    // Immediate so a second sidecar on the same workspace cannot slip its
    // bookings in between the re-check and the writes.
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(HandlerErr::tx_failed)?;
    let staged = session
        .stage_save(&SqliteStore::new(&tx))
        .map_err(engine_err)?;
    // Dropping `staged` on a failed commit keeps the session on its old
    // revision and shadow, matching the rolled back store.
    tx.commit().map_err(HandlerErr::commit_failed)?;
    let saved = session.finish_save(staged);
    Ok(json!({
        "revision": saved.revision,
        "entries": saved.entries,
        "teachers": saved.teachers,
        "overwroteConcurrentEdit": saved.overwrote_concurrent_edit
    }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

/// Resolves `params.sessionId` and runs `f` against that session.
fn with_session<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &mut EditingSession) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(session) = state.sessions.get_mut(&session_id) else {
        return err(
            &req.id,
            "no_session",
            "session not found",
            Some(json!({ "sessionId": session_id })),
        );
    };
    respond(req, f(conn, session))
}

fn handle_timetable_open(state: &mut AppState, req: &Request) -> Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    respond(req, timetable_open(state, &req.params))
}

fn handle_timetable_get(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |conn, session| grid_view(conn, session))
}

fn handle_timetable_usage(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |_, session| {
        Ok(json!({ "usage": session.usage() }))
    })
}

fn handle_timetable_select(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |_, session| timetable_select(session, &req.params))
}

fn handle_timetable_assign(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |_, session| timetable_assign(session, &req.params))
}

fn handle_timetable_resolve_conflict(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |_, session| {
        timetable_resolve_conflict(session, &req.params)
    })
}

fn handle_timetable_remove_entry(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, |_, session| {
        timetable_remove_entry(session, &req.params)
    })
}

fn handle_timetable_save(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, timetable_save)
}

fn handle_timetable_close(state: &mut AppState, req: &Request) -> Value {
    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let closed = state.sessions.remove(&session_id).is_some();
    if closed {
        log::debug!("session {} closed", session_id);
    }
    ok(&req.id, json!({ "closed": closed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "timetable.open" => Some(handle_timetable_open(state, req)),
        "timetable.get" => Some(handle_timetable_get(state, req)),
        "timetable.usage" => Some(handle_timetable_usage(state, req)),
        "timetable.select" => Some(handle_timetable_select(state, req)),
        "timetable.assign" => Some(handle_timetable_assign(state, req)),
        "timetable.resolveConflict" => Some(handle_timetable_resolve_conflict(state, req)),
        "timetable.removeEntry" => Some(handle_timetable_remove_entry(state, req)),
        "timetable.save" => Some(handle_timetable_save(state, req)),
        "timetable.close" => Some(handle_timetable_close(state, req)),
        _ => None,
    }
}
