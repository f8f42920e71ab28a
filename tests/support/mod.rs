//! Shared fixtures for integration suites.

use std::path::Path;
use tankhub::state::ServerState;
use tempfile::TempDir;

/// Base epoch for deterministic scenarios (mid-2025, UTC).
#[allow(dead_code)]
pub const T0: f64 = 1_750_000_000.0;

/// A server state rooted in a temp data dir with a synced clock.
#[allow(dead_code)]
pub fn test_state() -> (ServerState, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut state = ServerState::open(dir.path()).expect("open state");
    state.clock.mark_synced(T0);
    (state, dir)
}

/// Reopen a state over an existing data dir, synced to `epoch`.
#[allow(dead_code)]
pub fn state_at(dir: &Path, epoch: f64) -> ServerState {
    let mut state = ServerState::open(dir).expect("open state");
    state.clock.mark_synced(epoch);
    state
}
