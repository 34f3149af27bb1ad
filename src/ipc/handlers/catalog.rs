//! Reference data the engine reads: subjects, teachers, class-sections and
//! subject-teacher mappings. Only a bulk loader and readers live here; the
//! screens that author this data belong to the wider platform.

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_id, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{validate_id, ClassSection, Subject, Teacher};
use crate::store::{MappingCatalog, SqliteStore};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const MAX_NAME_LEN: usize = 120;
const MAX_PERIODS_PER_WEEK: u32 = 60;

#[derive(Debug, Deserialize)]
struct NamedItem {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClassItem {
    id: String,
    name: String,
    #[serde(default)]
    sections: Vec<NamedItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingItem {
    class_id: String,
    section_id: String,
    subject_id: String,
    teacher_id: String,
    periods_per_week: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ImportPayload {
    #[serde(default)]
    subjects: Vec<Subject>,
    #[serde(default)]
    teachers: Vec<Teacher>,
    #[serde(default)]
    classes: Vec<ClassItem>,
    #[serde(default)]
    mappings: Vec<MappingItem>,
}

fn clean_named(kind: &str, id: &str, name: &str) -> Result<(String, String), HandlerErr> {
    let id = validate_id(&format!("{} id", kind), id).map_err(HandlerErr::bad_params)?;
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(HandlerErr::bad_params(format!(
            "{} name must be 1..={} characters",
            kind, MAX_NAME_LEN
        ))
        .with_details(json!({ "id": id })));
    }
    Ok((id, name.to_string()))
}

fn upsert_named(conn: &Connection, table: &str, id: &str, name: &str) -> Result<(), HandlerErr> {
    let sql = format!(
        "INSERT INTO {}(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        table
    );
    conn.execute(&sql, (id, name)).map_err(|e| {
        HandlerErr::update_failed(e).with_details(json!({ "table": table }))
    })?;
    Ok(())
}

fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<bool, HandlerErr> {
    conn.query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query_failed)
}

fn catalog_import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payload: ImportPayload = if params.is_null() {
        ImportPayload::default()
    } else {
        serde_json::from_value(params.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid catalog payload: {}", e)))?
    };

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx_failed)?;

    for item in &payload.subjects {
        let (id, name) = clean_named("subject", &item.id, &item.name)?;
        upsert_named(&tx, "subjects", &id, &name)?;
    }
    for item in &payload.teachers {
        let (id, name) = clean_named("teacher", &item.id, &item.name)?;
        upsert_named(&tx, "teachers", &id, &name)?;
    }
    let mut section_count = 0usize;
    for class in &payload.classes {
        let (class_id, class_name) = clean_named("class", &class.id, &class.name)?;
        upsert_named(&tx, "classes", &class_id, &class_name)?;
        for section in &class.sections {
            let (section_id, section_name) = clean_named("section", &section.id, &section.name)?;
            tx.execute(
                "INSERT INTO sections(class_id, id, name) VALUES(?, ?, ?)
                 ON CONFLICT(class_id, id) DO UPDATE SET name = excluded.name",
                (&class_id, &section_id, &section_name),
            )
            .map_err(|e| HandlerErr::update_failed(e).with_details(json!({ "table": "sections" })))?;
            section_count += 1;
        }
    }

    let mut next_sort: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subject_teacher_mappings",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query_failed)?;
    for (i, m) in payload.mappings.iter().enumerate() {
        let reject = |message: String| {
            HandlerErr::bad_params(message).with_details(json!({ "mappingIndex": i }))
        };
        let class_id = validate_id("classId", &m.class_id).map_err(&reject)?;
        let section_id = validate_id("sectionId", &m.section_id).map_err(&reject)?;
        let subject_id = validate_id("subjectId", &m.subject_id).map_err(&reject)?;
        let teacher_id = validate_id("teacherId", &m.teacher_id).map_err(&reject)?;
        if !(1..=MAX_PERIODS_PER_WEEK).contains(&m.periods_per_week) {
            return Err(reject(format!(
                "periodsPerWeek must be in 1..={}",
                MAX_PERIODS_PER_WEEK
            )));
        }
        if !exists(
            &tx,
            "SELECT 1 FROM sections WHERE class_id = ? AND id = ?",
            (&class_id, &section_id),
        )? {
            return Err(reject(format!(
                "mapping references unknown class section {}_{}",
                class_id, section_id
            )));
        }
        if !exists(&tx, "SELECT 1 FROM subjects WHERE id = ?", [&subject_id])? {
            return Err(reject(format!("mapping references unknown subject {}", subject_id)));
        }
        if !exists(&tx, "SELECT 1 FROM teachers WHERE id = ?", [&teacher_id])? {
            return Err(reject(format!("mapping references unknown teacher {}", teacher_id)));
        }

        tx.execute(
            "INSERT INTO subject_teacher_mappings(
               id, class_id, section_id, subject_id, teacher_id, periods_per_week, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(class_id, section_id, subject_id, teacher_id) DO UPDATE SET
               periods_per_week = excluded.periods_per_week",
            (
                Uuid::new_v4().to_string(),
                &class_id,
                &section_id,
                &subject_id,
                &teacher_id,
                m.periods_per_week,
                next_sort,
            ),
        )
        .map_err(|e| {
            HandlerErr::update_failed(e).with_details(json!({ "table": "subject_teacher_mappings" }))
        })?;
        next_sort += 1;
    }

    tx.commit()
        .map_err(HandlerErr::commit_failed)?;

    log::info!(
        "catalog import: {} subjects, {} teachers, {} classes, {} sections, {} mappings",
        payload.subjects.len(),
        payload.teachers.len(),
        payload.classes.len(),
        section_count,
        payload.mappings.len()
    );
    Ok(json!({
        "subjects": payload.subjects.len(),
        "teachers": payload.teachers.len(),
        "classes": payload.classes.len(),
        "sections": section_count,
        "mappings": payload.mappings.len()
    }))
}

fn list_named(conn: &Connection, table: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!("SELECT id, name FROM {} ORDER BY name, id", table);
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query_failed)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;
    Ok(rows)
}

fn catalog_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let subjects = list_named(conn, "subjects")?;
    let teachers = list_named(conn, "teachers")?;

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, s.id, s.name
             FROM classes c
             LEFT JOIN sections s ON s.class_id = c.id
             ORDER BY c.name, c.id, s.id",
        )
        .map_err(HandlerErr::query_failed)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;

    let mut classes: Vec<serde_json::Value> = Vec::new();
    let mut last_class: Option<String> = None;
    for (class_id, class_name, section_id, section_name) in rows {
        if last_class.as_deref() != Some(class_id.as_str()) {
            classes.push(json!({ "id": class_id, "name": class_name, "sections": [] }));
            last_class = Some(class_id);
        }
        if let (Some(id), Some(name)) = (section_id, section_name) {
            if let Some(sections) = classes
                .last_mut()
                .and_then(|c| c.get_mut("sections"))
                .and_then(|s| s.as_array_mut())
            {
                sections.push(json!({ "id": id, "name": name }));
            }
        }
    }

    Ok(json!({
        "subjects": subjects,
        "teachers": teachers,
        "classes": classes
    }))
}

fn mappings_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_section = ClassSection::new(
        get_required_id(params, "classId")?,
        get_required_id(params, "sectionId")?,
    );
    let store = SqliteStore::new(conn);
    if !store
        .class_section_exists(&class_section)
        .map_err(HandlerErr::query_failed)?
    {
        return Err(HandlerErr::new("not_found", "class section not found")
            .with_details(json!({ "classSection": class_section.key() })));
    }
    let mappings = store
        .mappings(&class_section)
        .map_err(HandlerErr::query_failed)?;
    Ok(json!({ "mappings": mappings }))
}

fn handle_catalog_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match catalog_import(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_catalog_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(
            &req.id,
            json!({ "subjects": [], "teachers": [], "classes": [] }),
        );
    };
    match catalog_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_mappings_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match mappings_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.import" => Some(handle_catalog_import(state, req)),
        "catalog.list" => Some(handle_catalog_list(state, req)),
        "mappings.list" => Some(handle_mappings_list(state, req)),
        _ => None,
    }
}
