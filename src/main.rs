mod availability;
mod config;
mod db;
mod engine;
mod ipc;
mod model;
mod store;

use std::io::{self, BufRead, Write};

fn main() {
    let cfg = config::Config::from_env();
    // stdout carries the protocol; logs go to stderr only.
    env_logger::Builder::new()
        .parse_filters(&cfg.log_filter)
        .target(env_logger::Target::Stderr)
        .init();

    let mut state = ipc::AppState::default();
    if let Some(path) = cfg.workspace.as_ref() {
        match db::open_db(path) {
            Ok(conn) => {
                log::info!("workspace opened at {}", path.to_string_lossy());
                state.workspace = Some(path.clone());
                state.db = Some(conn);
            }
            Err(e) => log::warn!(
                "could not open startup workspace {}: {:#}",
                path.to_string_lossy(),
                e
            ),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::warn!("stdin closed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                log::warn!("unparseable request: {}", e);
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
