//! The environment flag that turns all instrumentation off.

use std::env;

/// Environment variable checked at the start of every invocation.
pub const KILL_SWITCH_VAR: &str = "FAAS_TRACING_SWITCH_OFF";

/// Returns `true` when the kill switch is set to `true` (in any case).
///
/// The variable is read on every call, never cached, so flipping it between
/// invocations takes effect immediately.
pub fn is_active() -> bool {
    env::var(KILL_SWITCH_VAR).is_ok_and(|value| value.eq_ignore_ascii_case("true"))
}
