//! Storage key layout for persisted sessions.

/// Keys used by the session store inside its namespace
pub struct SessionKeys;

impl SessionKeys {
    /// Id of the active session
    pub const ACTIVE: &'static str = "sessions.active";

    /// Ids of all known sessions (JSON array)
    pub const INDEX: &'static str = "sessions.index";

    /// Session info payload (JSON)
    pub fn info(session_id: &str) -> String {
        format!("sessions.{}.info", session_id)
    }

    /// Session token payload (JSON)
    pub fn tokens(session_id: &str) -> String {
        format!("sessions.{}.tokens", session_id)
    }
}
