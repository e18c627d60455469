//! Identifier helpers.

use uuid::Uuid;

use crate::time::now_ms;

/// Generate a session id of the form `<prefix>_<unix_ms>_<10 hex chars>`.
///
/// Sortable by creation time, unique enough for log file names.
pub fn make_session_id(prefix: &str) -> String {
    let rnd = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", now_ms(), &rnd[..10])
}

/// Generate a fresh message/op id.
pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}
