use regex::Regex;
use std::sync::LazyLock;

/// Schemes that must never appear in a redirect target, encoded or not.
static DANGEROUS_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(javascript|data|vbscript|file|about)\s*:").expect("valid regex"));

/// Paths that are never valid post-login targets.
const DISALLOWED_PATHS: &[&str] = &["/login", "/login/"];

/// Validate a candidate post-login redirect target.
///
/// Accepts only same-origin absolute paths: a single leading `/`, no
/// protocol-relative `//`, no backslashes, no dangerous schemes (checked
/// before and after percent-decoding), and no `..` traversal. Query string
/// and fragment are preserved. Returns the path unchanged when valid,
/// `None` otherwise.
pub fn sanitize_redirect_path(candidate: &str) -> Option<String> {
    if !candidate.starts_with('/') || candidate.starts_with("//") {
        return None;
    }
    if candidate.contains('\\') {
        return None;
    }
    if DANGEROUS_SCHEME.is_match(candidate) {
        return None;
    }

    // The target must survive URL decoding, and the decoded form must pass
    // the same checks (catches %-encoded schemes and separators).
    let decoded = urlencoding::decode(candidate).ok()?;
    if decoded.contains('\\') || decoded.starts_with("//") || DANGEROUS_SCHEME.is_match(&decoded) {
        return None;
    }

    // Path component only: strip query and fragment before structural checks.
    let path_part = candidate
        .split(['?', '#'])
        .next()
        .unwrap_or(candidate);
    let decoded_path = decoded.split(['?', '#']).next().unwrap_or(&decoded);

    if has_traversal(path_part) || has_traversal(decoded_path) {
        return None;
    }

    if DISALLOWED_PATHS.contains(&path_part) {
        return None;
    }

    Some(candidate.to_string())
}

/// True if any path segment is exactly `..`.
fn has_traversal(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
