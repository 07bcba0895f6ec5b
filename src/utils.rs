/// Seconds since the unix epoch.
pub fn now_seconds() -> crate::Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| format!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Epoch seconds at which a token granted now for `expires_in`
/// seconds stops being valid.
pub fn epoch_expiration(expires_in: u64) -> crate::Result<i64> {
    let now = std::time::SystemTime::now();
    Ok(now
        .checked_add(std::time::Duration::from_secs(expires_in))
        .ok_or_else(|| format!("can't add {:?} to time {:?}", expires_in, now))?
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| format!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Cap upstream diagnostics before they're echoed back to callers.
/// The full body still goes to the log.
pub fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_is_now_plus_expires_in() {
        let now = now_seconds().unwrap();
        let expires = epoch_expiration(3600).unwrap();
        let delta = expires - now;
        assert!((3598..=3602).contains(&delta), "unexpected delta {}", delta);
    }

    #[test]
    fn truncate_caps_long_diagnostics() {
        let s = "x".repeat(500);
        assert_eq!(truncate(&s, 200).len(), 200);
        assert_eq!(truncate("short", 200), "short");
    }
}
