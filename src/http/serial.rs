//! Serial diagnostic endpoints: JSON listing, CSV export, send-logs request.

use super::{require_pin, response, AppState};
use crate::serial::SerialEntry;
use crate::state::{Command, SerialRequestOutcome};
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Debug, Deserialize)]
pub struct SerialQuery {
    /// `server` or `client`.
    source: Option<String>,
    client: Option<String>,
    max: Option<usize>,
    since: Option<f64>,
}

fn render_entry(e: &SerialEntry) -> Value {
    json!({
        "epoch": e.epoch,
        "message": e.message,
        "level": e.level.as_str(),
        "source": e.source,
    })
}

fn collect_entries(
    st: &crate::state::ServerState,
    q: &SerialQuery,
) -> Result<Vec<Value>, Response> {
    let max = q.max.unwrap_or(DEFAULT_MAX_ENTRIES).clamp(1, 1000);
    let since = q.since.unwrap_or(0.0);
    match q.source.as_deref().unwrap_or("server") {
        "server" => Ok(st
            .serial
            .server_entries(max, since)
            .into_iter()
            .map(render_entry)
            .collect()),
        "client" => {
            let Some(client) = q.client.as_deref().filter(|c| !c.is_empty()) else {
                return Err(response::bad_request("client is required for source=client"));
            };
            Ok(st
                .serial
                .device_entries(client, max, since)
                .into_iter()
                .map(render_entry)
                .collect())
        }
        other => Err(response::bad_request(format!(
            "unknown source '{}', expected server or client",
            other
        ))),
    }
}

pub async fn get_serial_logs(State(app): State<AppState>, Query(q): Query<SerialQuery>) -> Response {
    let st = app.state.read().await;
    match collect_entries(&st, &q) {
        Ok(entries) => response::ok_json(json!({ "entries": entries })),
        Err(resp) => resp,
    }
}

/// CSV export with a chunked streamed body. Rows are rendered under the
/// read lock, then streamed after it is released.
pub async fn get_serial_export(
    State(app): State<AppState>,
    Query(q): Query<SerialQuery>,
) -> Response {
    let rows: Vec<String> = {
        let st = app.state.read().await;
        let entries = match collect_entries(&st, &q) {
            Ok(entries) => entries,
            Err(resp) => return resp,
        };
        entries
            .iter()
            .map(|e| {
                format!(
                    "{},{},{},{}\n",
                    e["epoch"],
                    e["level"].as_str().unwrap_or("info"),
                    csv_escape(e["source"].as_str().unwrap_or("")),
                    csv_escape(e["message"].as_str().unwrap_or("")),
                )
            })
            .collect()
    };

    let stream = async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"epoch,level,source,message\n"));
        for chunk in rows.chunks(64) {
            yield Ok(Bytes::from(chunk.concat()));
        }
    };

    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"serial_logs.csv\"",
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

pub async fn post_serial_request(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }
    let device_uid = match body
        .get("device")
        .or_else(|| body.get("client"))
        .or_else(|| body.get("c"))
        .and_then(|v| v.as_str())
    {
        Some(d) if !d.is_empty() => d.to_owned(),
        _ => return response::bad_request("device is required"),
    };

    let (reply, rx) = oneshot::channel();
    let cmd = Command::SerialRequest { device_uid, reply };
    if app.tx.send(cmd).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(SerialRequestOutcome::Dispatched)) => response::ok_message("send-logs request queued"),
        Ok(Ok(SerialRequestOutcome::Throttled)) => {
            response::throttled("send-logs recently requested for this device")
        }
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}
