#![forbid(unsafe_code)]

/// Number of task-id characters embedded in branch and workspace names.
pub const SHORT_ID_LEN: usize = 8;

/// First [`SHORT_ID_LEN`] characters of a task id.
#[must_use]
pub fn short_id(task_id: &str) -> String {
    task_id.chars().take(SHORT_ID_LEN).collect()
}

/// Branch name for a task's workspace: `{prefix}-{id8}`.
///
/// The directory of the workspace is named after the branch, which is what
/// makes recovery by directory-name search possible.
#[must_use]
pub fn branch_name(prefix: &str, task_id: &str) -> String {
    let prefix = sanitize_for_filesystem(prefix.trim());
    let id = short_id(task_id);
    if prefix.is_empty() {
        id
    } else {
        format!("{prefix}-{id}")
    }
}

#[must_use]
pub fn sanitize_for_filesystem(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        // Replace path separators and NUL and other control chars.
        if c == '/' || c == '\\' || c == '\0' || c.is_control() || c.is_whitespace() {
            out.push('-');
            continue;
        }
        // Windows reserved characters, plus the ones git refuses in ref names.
        if matches!(
            c,
            ':' | '*' | '?' | '"' | '<' | '>' | '|' | '~' | '^' | '[' | ']'
        ) {
            out.push('-');
            continue;
        }
        out.push(c);
    }
    // Collapse consecutive '-' for nicer paths.
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches(|c| c == '-' || c == '.').to_owned()
}

/// True for stored workspace paths that cannot point at a real workspace.
#[must_use]
pub fn is_placeholder_path(path: &str) -> bool {
    let p = path.trim();
    p.is_empty() || p == "." || p == "-" || p.eq_ignore_ascii_case("pending")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_uses_first_eight_chars_of_id() {
        let id = "3f9a1c2be4d54f0a9c1d2e3f4a5b6c7d";
        assert_eq!(short_id(id), "3f9a1c2b");
        assert_eq!(branch_name("agent-orch", id), "agent-orch-3f9a1c2b");
        assert_eq!(branch_name("", id), "3f9a1c2b");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn sanitizes_prefix() {
        assert_eq!(branch_name("my team/bots", "12345678xx"), "my-team-bots-12345678");
        assert_eq!(sanitize_for_filesystem("feat//x:y"), "feat-x-y");
        assert_eq!(sanitize_for_filesystem("..hidden"), "hidden");
    }

    #[test]
    fn detects_placeholders() {
        assert!(is_placeholder_path(""));
        assert!(is_placeholder_path("  "));
        assert!(is_placeholder_path("pending"));
        assert!(!is_placeholder_path("/tmp/ws/agent-orch-12345678"));
    }
}
