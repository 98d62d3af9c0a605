use crate::error::{CoreError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

const COMMAND_MAX_LEN: usize = 100;
const SCRIPT_NAME_MAX_LEN: usize = 50;

/// Shell metacharacters that must never reach the container shell, even
/// though commands are bound to positional parameters.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '"', '\'', '\n', '\r', '{', '}', '\\', '#',
];

// File-descriptor redirection like `2>`.
static FD_REDIRECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+[<>]").unwrap());

static SCRIPT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

/// Validate a user-provided solver command.
pub fn is_safe_command(command: &str) -> bool {
    if command.is_empty() || command.len() > COMMAND_MAX_LEN {
        return false;
    }
    if command.contains(SHELL_METACHARACTERS) {
        return false;
    }
    if command.contains("..") {
        return false;
    }
    if FD_REDIRECT_RE.is_match(command) {
        return false;
    }
    true
}

/// Validate a script file name (the `name` in a `./name` command).
pub fn is_safe_script_name(script_name: &str) -> bool {
    if script_name.is_empty() || script_name.len() > SCRIPT_NAME_MAX_LEN {
        return false;
    }
    if !SCRIPT_NAME_RE.is_match(script_name) {
        return false;
    }
    if script_name.contains("..") || script_name.starts_with('.') {
        return false;
    }
    true
}

/// Full command check as applied by the execution endpoint: the command
/// itself, plus the stricter script-name rule when it invokes `./name`.
pub fn validate_command(command: &str) -> Result<()> {
    if !is_safe_command(command) {
        return Err(CoreError::CommandRejected("Unsafe command detected".into()));
    }
    if let Some(first) = command.split_whitespace().next() {
        if let Some(name) = first.strip_prefix("./") {
            if !is_safe_script_name(name) {
                return Err(CoreError::CommandRejected("Unsafe command name".into()));
            }
        }
    }
    Ok(())
}
