//! Cloak format rules
//!
//! A cloak stands in for a hostname, so it has to stay within what the
//! network will relay: a bounded length, hostname-safe characters, and no
//! degenerate separators.

use crate::error::{AppError, Result};

/// Longest cloak the network will carry
pub const MAX_CLOAK_LEN: usize = 63;

/// Check a requested cloak against the format rules.
pub fn check(cloak: &str) -> Result<()> {
    if cloak.is_empty() {
        return Err(AppError::InvalidFormat("cloak is empty".to_string()));
    }

    if cloak.len() > MAX_CLOAK_LEN {
        return Err(AppError::InvalidFormat(format!(
            "cloak exceeds {} characters",
            MAX_CLOAK_LEN
        )));
    }

    if let Some(bad) = cloak
        .chars()
        .find(|&c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '/'))
    {
        return Err(AppError::InvalidFormat(format!(
            "cloak contains invalid character '{}'",
            bad
        )));
    }

    let first = cloak.chars().next().unwrap_or_default();
    let last = cloak.chars().last().unwrap_or_default();
    if matches!(first, '.' | '-' | '/') || matches!(last, '.' | '-' | '/') {
        return Err(AppError::InvalidFormat(
            "cloak begins or ends with a separator".to_string(),
        ));
    }

    // Split on both separators so "a./b" and "a/.b" are caught as well
    for segment in cloak.split(['/', '.']) {
        if segment.is_empty() {
            return Err(AppError::InvalidFormat(
                "cloak contains an empty segment".to_string(),
            ));
        }
        if segment.starts_with('-') {
            return Err(AppError::InvalidFormat(
                "cloak label begins with '-'".to_string(),
            ));
        }
    }

    Ok(())
}
