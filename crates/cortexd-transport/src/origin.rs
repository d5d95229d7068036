//! Origin/Host allowlist enforcement, checked before any state mutation.

/// Returns true if `origin` (the request's `Origin` header, if present) is
/// acceptable under `allowlist`. A request carrying no `Origin` header —
/// same-origin requests and most non-browser clients — is allowed
/// through; only a *mismatching* value is rejected. An empty allowlist
/// permits anything, treating the check as unconfigured rather than
/// deny-by-default.
pub fn origin_allowed(origin: Option<&str>, allowlist: &[String]) -> bool {
    match origin {
        None => true,
        Some(_) if allowlist.is_empty() => true,
        Some(origin) => allowlist.iter().any(|allowed| allowed == origin),
    }
}

/// As [`origin_allowed`], for the `Host` header, which is always present
/// on an HTTP/1.1 request.
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|allowed| allowed == host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn missing_origin_is_allowed() {
        assert!(origin_allowed(None, &list(&["https://example.com"])));
    }

    #[test]
    fn matching_origin_is_allowed() {
        assert!(origin_allowed(Some("https://example.com"), &list(&["https://example.com"])));
    }

    #[test]
    fn mismatching_origin_is_rejected() {
        assert!(!origin_allowed(Some("https://evil.example"), &list(&["https://example.com"])));
    }

    #[test]
    fn empty_allowlist_permits_any_origin() {
        assert!(origin_allowed(Some("https://anything.example"), &[]));
    }

    #[test]
    fn host_must_match_a_configured_allowlist() {
        let allowlist = list(&["cortex.example.com"]);
        assert!(host_allowed("cortex.example.com", &allowlist));
        assert!(!host_allowed("other.example.com", &allowlist));
    }

    #[test]
    fn empty_host_allowlist_permits_any_host() {
        assert!(host_allowed("whatever.example.com", &[]));
    }
}
