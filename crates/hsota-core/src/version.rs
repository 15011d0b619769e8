//! Remote/local firmware version gate.

/// Decide whether `remote` should replace the running `local` firmware.
///
/// This is literal string inequality, not semantic-version ordering: any
/// non-empty remote version that differs from the local one triggers an
/// update, including one that would sort "lower".
pub fn is_newer(remote: &str, local: &str) -> bool {
    !remote.is_empty() && remote != local
}
