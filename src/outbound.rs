//! Outbound command router.
//!
//! Everything the server pushes to a specific device goes through here:
//! configuration snapshots, relay commands, and send-logs requests. The
//! device address is encoded in the notefile name (`device:<uid>:<suffix>`);
//! the sidecar routes on it.

use crate::bus::Bus;
use crate::error::ServerResult;
use serde_json::{json, Value};

pub const CONFIG_SUFFIX: &str = "config.qi";
pub const RELAY_SUFFIX: &str = "relay.qi";
pub const SERIAL_REQUEST_SUFFIX: &str = "serial_request.qi";

/// Build the device-addressed notefile name.
pub fn device_file(device_uid: &str, suffix: &str) -> String {
    format!("device:{}:{}", device_uid, suffix)
}

/// Push a configuration snapshot to a device. The caller is responsible
/// for mirroring the snapshot into the local cache on success.
pub async fn dispatch_config<B: Bus>(bus: &B, device_uid: &str, config: Value) -> ServerResult<()> {
    bus.enqueue(&device_file(device_uid, CONFIG_SUFFIX), config, true)
        .await
}

/// Explicit relay set command.
pub async fn dispatch_relay<B: Bus>(
    bus: &B,
    device_uid: &str,
    relay: u32,
    state: bool,
    source: &str,
) -> ServerResult<()> {
    let body = json!({
        "relay": relay,
        "state": state,
        "source": source,
    });
    bus.enqueue(&device_file(device_uid, RELAY_SUFFIX), body, true)
        .await
}

/// Tank-scoped relay reset. Same queue as the set command; the device
/// dispatches on which field is present.
pub async fn dispatch_relay_clear<B: Bus>(
    bus: &B,
    device_uid: &str,
    tank: u32,
    source: &str,
) -> ServerResult<()> {
    let body = json!({
        "relay_reset_tank": tank,
        "source": source,
    });
    bus.enqueue(&device_file(device_uid, RELAY_SUFFIX), body, true)
        .await
}

/// Ask a device to upload its serial log buffer.
pub async fn request_serial_logs<B: Bus>(bus: &B, device_uid: &str, now: f64) -> ServerResult<()> {
    let body = json!({
        "request": "send_logs",
        "timestamp": now,
    });
    bus.enqueue(&device_file(device_uid, SERIAL_REQUEST_SUFFIX), body, true)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[test]
    fn device_file_encodes_the_address() {
        assert_eq!(
            device_file("dev:867000", "relay.qi"),
            "device:dev:867000:relay.qi"
        );
    }

    #[tokio::test]
    async fn relay_set_and_clear_use_distinct_shapes_on_one_queue() {
        let bus = MemoryBus::new();
        dispatch_relay(&bus, "dev:A", 2, true, "operator").await.unwrap();
        dispatch_relay_clear(&bus, "dev:A", 1, "operator").await.unwrap();

        let sent = bus.sent_to("device:dev:A:relay.qi");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].body["relay"], 2);
        assert_eq!(sent[0].body["state"], true);
        assert!(sent[0].body.get("relay_reset_tank").is_none());
        assert_eq!(sent[1].body["relay_reset_tank"], 1);
        assert!(sent[1].body.get("relay").is_none());
    }

    #[tokio::test]
    async fn serial_request_carries_the_timestamp() {
        let bus = MemoryBus::new();
        request_serial_logs(&bus, "dev:A", 1_700_000_000.0).await.unwrap();
        let sent = bus.sent_to("device:dev:A:serial_request.qi");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body["request"], "send_logs");
        assert_eq!(sent[0].body["timestamp"], 1_700_000_000.0);
        assert!(sent[0].sync);
    }
}
