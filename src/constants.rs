/// Marker appended to stdout/stderr whenever output is cut at the
/// environment's size ceiling. Output is never silently dropped.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Fixed path at which the workspace directory is mounted inside the
/// sandbox container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// File inside the workspace that holds the execution's stdin text.
pub const STDIN_FILE: &str = "stdin.txt";

/// Coarse pre-filter applied to submitted source before any container is
/// created. Defense in depth only; isolation is enforced by the sandbox,
/// not by this list.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    ":(){ :|:& };:",
    "/etc/passwd",
    "/etc/shadow",
    "mkfs.",
    "/dev/sda",
];
