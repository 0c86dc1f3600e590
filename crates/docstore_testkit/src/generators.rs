//! Property-based test generators using proptest.

use crate::fixtures::User;
use proptest::prelude::*;

/// Strategy for document ids of the form `users/{n}`.
pub fn user_id_strategy() -> impl Strategy<Value = String> {
    (1u32..16).prop_map(|n| format!("users/{n}"))
}

/// Strategy for users.
pub fn user_strategy() -> impl Strategy<Value = User> {
    (
        prop::string::string_regex("[A-Z][a-z]{1,10}").expect("Invalid regex"),
        0u32..120,
    )
        .prop_map(|(name, age)| User::new(&name, age))
}

/// One step applied to a session.
#[derive(Debug, Clone)]
pub enum SessionStep {
    /// Store a user under an id.
    Store(String, User),
    /// Delete an id.
    Delete(String),
}

impl SessionStep {
    /// Returns the id the step touches.
    pub fn id(&self) -> &str {
        match self {
            SessionStep::Store(id, _) | SessionStep::Delete(id) => id,
        }
    }
}

/// Strategy for a single session step.
pub fn session_step_strategy() -> impl Strategy<Value = SessionStep> {
    prop_oneof![
        3 => (user_id_strategy(), user_strategy()).prop_map(|(id, user)| SessionStep::Store(id, user)),
        1 => user_id_strategy().prop_map(SessionStep::Delete),
    ]
}

/// Strategy for a sequence of session steps.
pub fn session_steps_strategy(max_len: usize) -> impl Strategy<Value = Vec<SessionStep>> {
    prop::collection::vec(session_step_strategy(), 1..max_len)
}

/// Strategy for compare-exchange keys.
pub fn compare_exchange_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}/[a-z0-9]{1,8}").expect("Invalid regex")
}

/// Proptest configuration for session tests.
pub fn session_proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    }
}
