use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::TIMETABLE_SETTINGS_KEY;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

const TIMETABLE_SECTION: &str = "timetable";
const MAX_WORKING_DAYS: usize = 7;
const MAX_DAY_CODE_LEN: usize = 16;
const MAX_PERIODS: i64 = 16;
const MAX_BREAKS: usize = 8;

fn default_timetable() -> Value {
    json!({
        "workingDays": ["MON", "TUE", "WED", "THU", "FRI"],
        "totalPeriods": 8,
        "breaks": [
            { "afterPeriod": 3, "label": "Recess", "durationMinutes": 15 },
            { "afterPeriod": 5, "label": "Lunch", "durationMinutes": 40 }
        ]
    })
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_working_days(v: &Value) -> Result<Value, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "workingDays must be an array".to_string())?;
    if arr.is_empty() || arr.len() > MAX_WORKING_DAYS {
        return Err(format!("workingDays must hold 1..={} days", MAX_WORKING_DAYS));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let code = parse_string_max(item, "workingDays[]", MAX_DAY_CODE_LEN)?;
        if code.is_empty() {
            return Err("workingDays[] must not be empty".to_string());
        }
        if !seen.insert(code.clone()) {
            return Err(format!("duplicate working day: {}", code));
        }
        out.push(Value::String(code));
    }
    Ok(Value::Array(out))
}

fn parse_breaks(v: &Value) -> Result<Value, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "breaks must be an array".to_string())?;
    if arr.len() > MAX_BREAKS {
        return Err(format!("breaks must hold at most {} items", MAX_BREAKS));
    }
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let obj = item
            .as_object()
            .ok_or_else(|| "breaks[] must be an object".to_string())?;
        let mut parsed = Map::new();
        for (k, v) in obj {
            match k.as_str() {
                "afterPeriod" => {
                    let n = parse_i64_range(v, "breaks[].afterPeriod", 1, MAX_PERIODS - 1)?;
                    parsed.insert(k.clone(), json!(n));
                }
                "label" => {
                    let label = parse_string_max(v, "breaks[].label", 40)?;
                    if label.is_empty() {
                        return Err("breaks[].label must not be empty".to_string());
                    }
                    parsed.insert(k.clone(), Value::String(label));
                }
                "durationMinutes" => {
                    let n = parse_i64_range(v, "breaks[].durationMinutes", 1, 180)?;
                    parsed.insert(k.clone(), json!(n));
                }
                _ => return Err(format!("unknown break field: {}", k)),
            }
        }
        for required in ["afterPeriod", "label", "durationMinutes"] {
            if !parsed.contains_key(required) {
                return Err(format!("breaks[] missing {}", required));
            }
        }
        out.push(Value::Object(parsed));
    }
    Ok(Value::Array(out))
}

fn merge_timetable_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match k.as_str() {
            "workingDays" => {
                obj.insert(k.clone(), parse_working_days(v)?);
            }
            "totalPeriods" => {
                obj.insert(k.clone(), json!(parse_i64_range(v, k, 1, MAX_PERIODS)?));
            }
            "breaks" => {
                obj.insert(k.clone(), parse_breaks(v)?);
            }
            _ => return Err(format!("unknown timetable field: {}", k)),
        }
    }

    // A break after the last period would sit outside the school day.
    let total = obj
        .get("totalPeriods")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if patch.contains_key("totalPeriods") && !patch.contains_key("breaks") {
        // Shortening the day drops the breaks it no longer reaches.
        if let Some(breaks) = obj.get_mut("breaks").and_then(|v| v.as_array_mut()) {
            let before = breaks.len();
            breaks.retain(|b| b.get("afterPeriod").and_then(|v| v.as_i64()).unwrap_or(0) < total);
            if breaks.len() < before {
                log::info!(
                    "dropped {} break(s) beyond period {}",
                    before - breaks.len(),
                    total
                );
            }
        }
    }
    let mut after_seen = HashSet::new();
    if let Some(breaks) = obj.get("breaks").and_then(|v| v.as_array()) {
        for b in breaks {
            let after = b.get("afterPeriod").and_then(|v| v.as_i64()).unwrap_or(0);
            if after >= total {
                return Err(format!(
                    "break after period {} must come before the last period {}",
                    after, total
                ));
            }
            if !after_seen.insert(after) {
                return Err(format!("more than one break after period {}", after));
            }
        }
    }
    Ok(())
}

/// Saved timetable section merged over the defaults, and whether anything
/// has been saved at all.
fn load_timetable(conn: &rusqlite::Connection) -> anyhow::Result<(Value, bool)> {
    let mut current = default_timetable();
    let Some(saved) = db::settings_get_json(conn, TIMETABLE_SETTINGS_KEY)? else {
        return Ok((current, false));
    };
    if let Some(saved_obj) = saved.as_object() {
        // Best-effort apply: malformed historical values should not block setup UI.
        if let Err(e) = merge_timetable_patch(&mut current, saved_obj) {
            log::warn!("ignoring stored timetable settings: {}", e);
            current = default_timetable();
        }
    }
    Ok((current, true))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match load_timetable(conn) {
        Ok((timetable, configured)) => ok(
            &req.id,
            json!({
                "timetable": timetable,
                "configured": configured
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    if section != TIMETABLE_SECTION {
        return err(&req.id, "bad_params", "unknown section", None);
    }
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_timetable(conn) {
        Ok((v, _)) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_timetable_patch(&mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, TIMETABLE_SETTINGS_KEY, &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if !state.sessions.is_empty() {
        log::info!(
            "timetable settings changed; {} open session(s) keep the settings they loaded",
            state.sessions.len()
        );
    }
    ok(&req.id, json!({ "ok": true, "timetable": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
