//! Path helpers for config values.

use std::path::PathBuf;

/// Resolve a config path, expanding a leading `~` to `$HOME`.
///
/// - `"~"` → `/home/user`
/// - `"~/run/w.pid"` → `/home/user/run/w.pid`
/// - Anything else, or an unset `$HOME`, passes through unchanged.
pub fn config_path(raw: &str) -> PathBuf {
    expand_home(raw, std::env::var_os("HOME").map(PathBuf::from))
}

fn expand_home(raw: &str, home: Option<PathBuf>) -> PathBuf {
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(raw),
    };
    match home {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(raw),
    }
}
