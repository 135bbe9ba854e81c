//! Minimal parser for the engine's `key=value,key=(group)` configuration
//! string grammar.

/// Splits a config string into top-level `(key, value)` pairs. Commas inside
/// parentheses or brackets belong to the value; quotes are stripped from
/// scalar values.
pub fn parse(config: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = config.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                push_pair(&config[start..i], &mut out);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_pair(&config[start..], &mut out);
    out
}

fn push_pair(chunk: &str, out: &mut Vec<(String, String)>) {
    let chunk = chunk.trim();
    if chunk.is_empty() {
        return;
    }
    match chunk.split_once('=') {
        Some((key, value)) => out.push((
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        )),
        None => out.push((chunk.to_string(), String::new())),
    }
}

/// Last value wins, matching the engine's "later settings override earlier
/// ones" rule.
pub fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// A bare `key` or `key=true` both count as set.
pub fn flag(pairs: &[(String, String)], key: &str) -> bool {
    matches!(get(pairs, key), Some("" | "true"))
}

/// Extracts `inner` from a grouped value like `(enabled=true,path=journal)`.
pub fn group_get<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    let inner = value.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0usize;
    let mut start = 0usize;
    let bytes = inner.as_bytes();
    let mut chunks = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                chunks.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    chunks.push(&inner[start..]);
    chunks
        .into_iter()
        .rev()
        .filter_map(|c| c.trim().split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches('"'))
}

/// Parses a 16-digit (or shorter) hex timestamp value.
pub fn parse_hex_timestamp(value: &str) -> Option<u64> {
    u64::from_str_radix(value, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::{flag, get, group_get, parse, parse_hex_timestamp};

    #[test]
    fn splits_top_level_pairs_only() {
        let pairs = parse("create,cache_size=128M,log=(enabled=true,path=journal),salvage=true");
        assert_eq!(get(&pairs, "cache_size"), Some("128M"));
        assert_eq!(get(&pairs, "log"), Some("(enabled=true,path=journal)"));
        assert!(flag(&pairs, "create"));
        assert!(flag(&pairs, "salvage"));
        assert!(!flag(&pairs, "readonly"));
    }

    #[test]
    fn later_settings_override_earlier_ones() {
        let pairs = parse("log=(enabled=true),log=(enabled=false)");
        assert_eq!(get(&pairs, "log"), Some("(enabled=false)"));
    }

    #[test]
    fn group_lookup_and_quoted_values() {
        let pairs = parse("compatibility=(require_min=\"3.1.0\")");
        let compat = get(&pairs, "compatibility").expect("compat");
        assert_eq!(group_get(compat, "require_min"), Some("3.1.0"));
        assert_eq!(group_get("(release=3.0)", "release"), Some("3.0"));
        assert_eq!(group_get("(release=3.0)", "missing"), None);
    }

    #[test]
    fn hex_timestamps() {
        assert_eq!(parse_hex_timestamp("0000000000000064"), Some(100));
        assert_eq!(parse_hex_timestamp("ff"), Some(255));
        assert_eq!(parse_hex_timestamp("zz"), None);
    }
}
