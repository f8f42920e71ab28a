//! Contacts endpoints: notification targets plus derived fleet context.

use super::{require_pin, response, AppState};
use crate::state::Command;
use axum::{extract::State, response::Response, Json};
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub async fn get_contacts(State(app): State<AppState>) -> Response {
    let st = app.state.read().await;

    let mut sites: Vec<String> = st
        .fleet
        .iter()
        .map(|r| r.site.clone())
        .filter(|s| !s.is_empty())
        .collect();
    sites.sort();
    sites.dedup();

    let alarms: Vec<Value> = st
        .fleet
        .iter()
        .filter(|r| r.alarm_active)
        .map(|r| {
            json!({
                "device": r.device_uid,
                "tank": r.tank,
                "site": r.site,
                "label": r.label,
                "alarmType": r.alarm_type,
            })
        })
        .collect();

    response::ok_json(json!({
        "contacts": st.settings.contacts,
        "smsPrimary": st.settings.sms_primary,
        "smsSecondary": st.settings.sms_secondary,
        "emailTo": st.settings.email_to,
        "sites": sites,
        "alarms": alarms,
    }))
}

pub async fn post_contacts(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Err(resp) = require_pin(&app, &body).await {
        return resp;
    }

    let Some(contacts) = body.get("contacts").and_then(|v| v.as_array()) else {
        return response::bad_request("contacts array is required");
    };
    for (i, contact) in contacts.iter().enumerate() {
        let Some(obj) = contact.as_object() else {
            return response::bad_request(format!("contact {} must be an object", i));
        };
        let phone = obj.get("phone").and_then(|v| v.as_str()).unwrap_or("");
        let email = obj.get("email").and_then(|v| v.as_str()).unwrap_or("");
        if phone.is_empty() && email.is_empty() {
            return response::bad_request(format!("contact {} needs a phone or email", i));
        }
        if !phone.is_empty() && !phone.starts_with('+') {
            return response::bad_request(format!("contact {} phone must be E.164 (+...)", i));
        }
        if !email.is_empty() && !email.contains('@') {
            return response::bad_request(format!("contact {} email is invalid", i));
        }
    }

    let (reply, rx) = oneshot::channel();
    let cmd = Command::UpdateSettings {
        patch: json!({ "contacts": contacts }),
        reply,
    };
    if app.tx.send(cmd).await.is_err() {
        return response::internal_error("serial task unavailable");
    }
    match rx.await {
        Ok(Ok(())) => response::ok_message("contacts saved"),
        Ok(Err(e)) => response::from_server_error(&e),
        Err(_) => response::internal_error("serial task dropped the request"),
    }
}
