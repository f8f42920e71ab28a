// tankhub: Fleet telemetry aggregator and alert dispatcher.
// Exposes modules for integration testing.

pub mod alerts;
pub mod bus;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod decode;
pub mod device_config;
pub mod error;
pub mod fleet;
pub mod history;
pub mod http;
pub mod ingest;
pub mod outbound;
pub mod serial;
pub mod settings;
pub mod state;
