//! Command text sanitization for shell-interpreting protocols

/// Characters a remote shell would treat as syntax
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '"', '\'', '\\',
];

/// Remove every shell metacharacter from `command`
pub fn strip_shell_metacharacters(command: &str) -> String {
    command
        .chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(c))
        .collect()
}

/// Remote account names never need quoting characters
pub fn sanitize_username(username: &str) -> String {
    strip_shell_metacharacters(username).trim().to_string()
}
