//! Shell job composition for container execution.
//!
//! Every job is an argv list `["bash", "-c", script, arg0, arg1, ...]`
//! where user-controlled values are bound to shell positional parameters.
//! Nothing user-controlled is ever interpolated into the script text.

use crate::error::Result;
use crate::security::command::validate_command;

/// A `bash -c` invocation: the fixed script plus its positional
/// parameters (`$0`, `$1`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ShellJob {
    pub script: String,
    pub args: Vec<String>,
}

impl ShellJob {
    fn new(script: &str, args: Vec<String>) -> Self {
        Self {
            script: script.to_string(),
            args,
        }
    }
}

/// Solver invocation: source the environment, enter the case directory,
/// execute the validated command. `$0` is the environment file, `$1` the
/// case path; after the `shift`, `"$@"` is exactly the user argv.
pub fn solver_job(bashrc: &str, container_case_path: &str, command: &str) -> Result<ShellJob> {
    validate_command(command)?;

    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    let script = if argv.first().is_some_and(|c| c.starts_with("./")) {
        // Case-local scripts are made executable first.
        r#"source "$0" && cd "$1" && shift && chmod +x "$1" && exec "$@""#
    } else {
        r#"source "$0" && cd "$1" && shift && exec "$@""#
    };

    let mut args = vec![bashrc.to_string(), container_case_path.to_string()];
    args.extend(argv);
    Ok(ShellJob::new(script, args))
}

/// Enumerate `category/case` tutorial directories that look like complete
/// cases (both `system/` and `constant/` present).
pub fn list_tutorials_job(bashrc: &str) -> ShellJob {
    ShellJob::new(
        r#"source "$0" > /dev/null 2>&1 && cd "$FOAM_TUTORIALS" && find . -mindepth 2 -maxdepth 2 -type d -exec test -d {}/system -a -d {}/constant \; -print"#,
        vec![bashrc.to_string()],
    )
}

/// Copy one tutorial from the image into the mounted run directory and
/// make its `Allrun` executable.
pub fn load_tutorial_job(bashrc: &str, container_case_path: &str, tutorial: &str) -> ShellJob {
    ShellJob::new(
        r#"source "$0" > /dev/null 2>&1 && mkdir -p "$1" && cp -r "$FOAM_TUTORIALS/$2/." "$1" && chmod +x "$1/Allrun""#,
        vec![
            bashrc.to_string(),
            container_case_path.to_string(),
            tutorial.to_string(),
        ],
    )
}

/// Write the startup permission-probe file through the container.
pub fn touch_probe_job(container_check_path: &str, filename: &str) -> ShellJob {
    ShellJob::new(
        r#"touch "$0/$1""#,
        vec![container_check_path.to_string(), filename.to_string()],
    )
}

/// Remove a probe file the host could not delete itself.
pub fn remove_probe_job(container_check_path: &str, filename: &str) -> ShellJob {
    ShellJob::new(
        r#"rm -f "$0/$1""#,
        vec![container_check_path.to_string(), filename.to_string()],
    )
}
