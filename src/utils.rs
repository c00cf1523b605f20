//! Utility functions module
//!
//! Lock helpers and small string helpers shared by the scheduler, the
//! fallback chain and the tool loop.

/// Locks a mutex, recovering the inner value if a previous holder panicked.
/// Only for plain counter/flag state.
pub fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns at most `max` characters of `s`, appending "..." when shortened.
pub fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Cuts `s` to `max` characters and appends a visible truncation marker
/// carrying the original length. Returns the input unchanged when it fits.
pub fn truncate_with_marker(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{head}\n... [TRUNCATED - {total} chars total]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_strings() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("hello world", 8), "hello...");
    }

    #[test]
    fn truncate_with_marker_reports_total() {
        let long = "x".repeat(12);
        let out = truncate_with_marker(&long, 5);
        assert!(out.starts_with("xxxxx\n"));
        assert!(out.ends_with("[TRUNCATED - 12 chars total]"));
        assert_eq!(truncate_with_marker("abc", 5), "abc");
    }

    #[test]
    fn lock_or_recover_survives_poison() {
        let m = std::sync::Arc::new(std::sync::Mutex::new(1));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(m.is_poisoned());
        *lock_or_recover(&m) += 1;
        assert_eq!(*lock_or_recover(&m), 2);
    }
}
