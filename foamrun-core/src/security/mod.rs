//! Input hardening: path resolution against the case root, command
//! validation for container execution, and error-message redaction.

pub mod command;
pub mod paths;
pub mod sanitize;

pub use command::{is_safe_command, is_safe_script_name, validate_command};
pub use paths::{assert_safe_root, resolve, resolve_new, safe_join};
pub use sanitize::redact_paths;
