//! Pure predicates over paths and command lines. Nothing here touches the
//! filesystem; callers resolve and confine actual paths separately.

/// Shell metacharacters that disqualify a command outright, regardless of
/// prefix allow-lists.
const COMMAND_FORBIDDEN_TOKENS: [&str; 8] = [";", "&&", "||", "|", "`", "$(", "\n", "\r"];

fn norm_rel_path(path: &str) -> String {
    path.replace('\\', "/").trim().to_string()
}

/// A path is safe when it is relative, stays inside the tree (no `..`), has
/// no drive letters or colons, and uses only `[A-Za-z0-9._/-]`.
pub fn is_safe_relative_path(path: &str) -> bool {
    let path = norm_rel_path(path);
    if path.is_empty() {
        return false;
    }
    if path.starts_with('/') {
        return false;
    }
    if path.contains(':') {
        return false;
    }
    if path.split('/').any(|part| part == "..") {
        return false;
    }
    path.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

/// Prefix containment over normalized relative paths. An empty root matches
/// everything.
fn is_under(path: &str, roots: &[String]) -> bool {
    let path = norm_rel_path(path);
    roots.iter().any(|root| {
        let root = norm_rel_path(root);
        if root.is_empty() {
            return true;
        }
        path == root || path.starts_with(&format!("{}/", root.trim_end_matches('/')))
    })
}

/// Deny wins. With an empty allow list, any safe non-denied path passes;
/// otherwise the path must equal or descend from an allow entry.
pub fn is_write_allowed(rel_path: &str, allow_write: &[String], deny_write: &[String]) -> bool {
    if !is_safe_relative_path(rel_path) {
        return false;
    }
    if !deny_write.is_empty() && is_under(rel_path, deny_write) {
        return false;
    }
    if allow_write.is_empty() {
        return true;
    }
    is_under(rel_path, allow_write)
}

/// A command passes when, after stripping, it is non-empty, carries none of
/// the shell metacharacters, and starts with a literal allowed prefix.
pub fn is_command_allowed(cmd: &str, allow_prefixes: &[String]) -> bool {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return false;
    }
    if COMMAND_FORBIDDEN_TOKENS.iter().any(|token| cmd.contains(token)) {
        return false;
    }
    allow_prefixes.iter().any(|prefix| cmd.starts_with(prefix.as_str()))
}
