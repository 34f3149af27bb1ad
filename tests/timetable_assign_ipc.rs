use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

/// Six-day week, eight periods, classes 8 and 9 (section A) sharing t1.
fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-setup",
        "setup.update",
        json!({
            "section": "timetable",
            "patch": {
                "workingDays": ["MON", "TUE", "WED", "THU", "FRI", "SAT"],
                "totalPeriods": 8
            }
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-catalog",
        "catalog.import",
        json!({
            "subjects": [
                { "id": "math", "name": "Mathematics" },
                { "id": "phys", "name": "Physics" },
                { "id": "chem", "name": "Chemistry" }
            ],
            "teachers": [
                { "id": "t1", "name": "R. Iyer" },
                { "id": "t2", "name": "M. Okafor" }
            ],
            "classes": [
                { "id": "8", "name": "Grade 8", "sections": [{ "id": "A", "name": "A" }] },
                { "id": "9", "name": "Grade 9", "sections": [{ "id": "A", "name": "A" }] }
            ],
            "mappings": [
                { "classId": "8", "sectionId": "A", "subjectId": "math", "teacherId": "t1", "periodsPerWeek": 2 },
                { "classId": "8", "sectionId": "A", "subjectId": "phys", "teacherId": "t2", "periodsPerWeek": 6 },
                { "classId": "9", "sectionId": "A", "subjectId": "math", "teacherId": "t1", "periodsPerWeek": 6 },
                { "classId": "9", "sectionId": "A", "subjectId": "chem", "teacherId": "t2", "periodsPerWeek": 1 }
            ]
        }),
    );
}

fn open_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
) -> String {
    let opened = request_ok(
        stdin,
        reader,
        id,
        "timetable.open",
        json!({ "classId": class_id, "sectionId": "A" }),
    );
    opened
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string()
}

fn assign(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    session_id: &str,
    day: &str,
    period: u32,
    subject_id: &str,
    teacher_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "timetable.assign",
        json!({
            "sessionId": session_id,
            "day": day,
            "period": period,
            "subjectId": subject_id,
            "teacherId": teacher_id
        }),
    )
}

fn status(result: &serde_json::Value) -> &str {
    result.get("status").and_then(|v| v.as_str()).unwrap_or("")
}

#[test]
fn quota_blocks_the_third_period_of_a_two_period_mapping() {
    let workspace = temp_dir("timetabled-quota");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_school(&mut stdin, &mut reader);
    let session = open_session(&mut stdin, &mut reader, "2", "8");

    let first = assign(&mut stdin, &mut reader, "3", &session, "MON", 1, "math", "t1");
    assert_eq!(status(&first), "applied");
    let second = assign(&mut stdin, &mut reader, "4", &session, "TUE", 1, "math", "t1");
    assert_eq!(status(&second), "applied");
    let third = assign(&mut stdin, &mut reader, "5", &session, "WED", 1, "math", "t1");
    assert_eq!(status(&third), "quotaExceeded");
    assert_eq!(third["used"], json!(2));
    assert_eq!(third["limit"], json!(2));

    let usage = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.usage",
        json!({ "sessionId": session }),
    );
    let math = usage["usage"]
        .as_array()
        .and_then(|rows| rows.iter().find(|r| r["subjectId"] == json!("math")))
        .cloned()
        .expect("math usage");
    assert_eq!(math["used"], json!(2));
    assert_eq!(math["remaining"], json!(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn same_cell_parallel_groups_and_local_duplicates() {
    let workspace = temp_dir("timetabled-parallel");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_school(&mut stdin, &mut reader);
    let session = open_session(&mut stdin, &mut reader, "2", "8");

    let a = assign(&mut stdin, &mut reader, "3", &session, "MON", 2, "math", "t1");
    let b = assign(&mut stdin, &mut reader, "4", &session, "MON", 2, "phys", "t2");
    assert_eq!(status(&a), "applied");
    assert_eq!(status(&b), "applied");
    let dup = assign(&mut stdin, &mut reader, "5", &session, "MON", 2, "math", "t1");
    assert_eq!(status(&dup), "localDuplicate");
    assert_eq!(dup["teacherId"], json!("t1"));

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.get",
        json!({ "sessionId": session }),
    );
    assert_eq!(view["days"][0]["day"], json!("MON"));
    let slot = &view["days"][0]["slots"][0];
    assert_eq!(slot["period"], json!(2));
    assert_eq!(slot["entries"].as_array().map(|e| e.len()), Some(2));
    assert_eq!(slot["entries"][0]["subjectName"], json!("Mathematics"));
    assert_eq!(slot["entries"][1]["teacherName"], json!("M. Okafor"));

    let bad_day = request(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.assign",
        json!({ "sessionId": session, "day": "SUN", "period": 1, "subjectId": "math", "teacherId": "t1" }),
    );
    assert_eq!(error_code(&bad_day), "invalid_target");
    let bad_mapping = request(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.assign",
        json!({ "sessionId": session, "day": "MON", "period": 1, "subjectId": "chem", "teacherId": "t2" }),
    );
    assert_eq!(error_code(&bad_mapping), "unknown_mapping");

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.removeEntry",
        json!({ "sessionId": session, "day": "MON", "period": 2, "entryIndex": 0 }),
    );
    assert_eq!(status(&removed), "removed");
    assert_eq!(removed["entry"], json!({ "subjectId": "math", "teacherId": "t1" }));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "timetable.removeEntry",
        json!({ "sessionId": session, "day": "MON", "period": 2, "entryIndex": 1 }),
    );
    assert_eq!(status(&again), "notFound");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn cross_class_conflict_then_cancel_or_override() {
    let workspace = temp_dir("timetabled-conflict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_school(&mut stdin, &mut reader);

    let class_8 = open_session(&mut stdin, &mut reader, "2", "8");
    let _ = assign(&mut stdin, &mut reader, "3", &class_8, "MON", 1, "math", "t1");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.save",
        json!({ "sessionId": class_8 }),
    );

    let class_9 = open_session(&mut stdin, &mut reader, "5", "9");
    let clash = assign(&mut stdin, &mut reader, "6", &class_9, "MON", 1, "math", "t1");
    assert_eq!(status(&clash), "crossClassConflict");
    assert_eq!(clash["teacherId"], json!("t1"));
    assert_eq!(clash["day"], json!("MON"));
    assert_eq!(clash["period"], json!(1));
    assert_eq!(clash["conflictingClass"], json!({ "classId": "8", "sectionId": "A" }));
    assert_eq!(clash["cellState"]["state"], json!("conflictDetected"));

    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.resolveConflict",
        json!({ "sessionId": class_9, "decision": "cancel" }),
    );
    assert_eq!(status(&cancelled), "cancelled");
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.get",
        json!({ "sessionId": class_9 }),
    );
    assert_eq!(view["days"][0]["slots"], json!([]));

    let nothing = request(
        &mut stdin,
        &mut reader,
        "9",
        "timetable.resolveConflict",
        json!({ "sessionId": class_9, "decision": "override" }),
    );
    assert_eq!(error_code(&nothing), "no_pending_conflict");

    let clash = assign(&mut stdin, &mut reader, "10", &class_9, "MON", 1, "math", "t1");
    assert_eq!(status(&clash), "crossClassConflict");
    let overridden = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "timetable.resolveConflict",
        json!({ "sessionId": class_9, "decision": "override" }),
    );
    assert_eq!(status(&overridden), "applied");
    assert_eq!(overridden["cellState"]["state"], json!("applied"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "timetable.save",
        json!({ "sessionId": class_9 }),
    );

    // Class 8's stored grid is untouched by the override.
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "timetable.open",
        json!({ "classId": "8", "sectionId": "A" }),
    );
    assert_eq!(
        reopened["view"]["days"][0]["slots"][0]["entries"][0]["teacherId"],
        json!("t1")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn all_days_assignment_skips_the_conflicting_day() {
    let workspace = temp_dir("timetabled-all-days");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_school(&mut stdin, &mut reader);

    let class_8 = open_session(&mut stdin, &mut reader, "2", "8");
    let _ = assign(&mut stdin, &mut reader, "3", &class_8, "TUE", 2, "math", "t1");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.save",
        json!({ "sessionId": class_8 }),
    );

    let class_9 = open_session(&mut stdin, &mut reader, "5", "9");
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.assign",
        json!({
            "sessionId": class_9,
            "allDays": true,
            "period": 2,
            "subjectId": "math",
            "teacherId": "t1"
        }),
    );
    assert_eq!(status(&report), "allDays");
    assert_eq!(report["applied"], json!(["MON", "WED", "THU", "FRI", "SAT"]));
    assert_eq!(report["skipped"][0]["day"], json!("TUE"));
    assert_eq!(report["skipped"][0]["reason"]["kind"], json!("conflict"));
    assert_eq!(report["skipped"].as_array().map(|s| s.len()), Some(1));

    let usage = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "timetable.usage",
        json!({ "sessionId": class_9 }),
    );
    assert_eq!(usage["usage"][0]["used"], json!(5));

    drop(stdin);
    let _ = child.wait();
}
