use atty::Stream;
use color_eyre::Result;
use funcpack_core::BuildError;
use serde::Serialize;
use serde_json::{json, Value};

use crate::style::Style;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn from_build_error(err: &BuildError) -> Self {
        let mut details = json!({ "code": err.code() });
        if err.is_in_progress() {
            details["hint"] = json!("another process is building this function; retry once it finishes");
        }
        if matches!(err, BuildError::UnsupportedRuntime { .. }) {
            details["hint"] = json!(format!(
                "supported runtimes: {}",
                funcpack_core::SUPPORTED_RUNTIMES.join(", ")
            ));
        }
        if err.is_user_error() {
            Self::user_error(err.to_string(), details)
        } else {
            Self::failure(err.to_string(), details)
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OutputOptions {
    pub quiet: bool,
    pub json: bool,
    pub no_color: bool,
}

pub fn to_json_response(command: &str, outcome: &ExecutionOutcome) -> Value {
    json!({
        "command": command,
        "status": outcome.status,
        "message": outcome.message,
        "details": outcome.details,
    })
}

pub fn emit_output(opts: &OutputOptions, command: &str, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    if opts.json {
        let payload = to_json_response(command, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(code);
    }

    if outcome.status == CommandStatus::Ok {
        if opts.quiet {
            return Ok(code);
        }
        if is_passthrough(&outcome.details) {
            println!("{}", outcome.message);
        } else {
            let style = Style::new(opts.no_color, atty::is(Stream::Stdout));
            println!("{}", style.status(outcome.status, &outcome.message));
        }
    } else {
        let style = Style::new(opts.no_color, atty::is(Stream::Stderr));
        eprintln!("{}", style.status(outcome.status, &outcome.message));
        if let Some(hint) = hint_from_details(&outcome.details) {
            eprintln!("{}", style.info(&format!("Tip: {hint}")));
        }
    }
    Ok(code)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn is_passthrough(details: &Value) -> bool {
    details
        .as_object()
        .and_then(|map| map.get("passthrough"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn contention_is_a_user_error_with_a_hint() {
        let err = BuildError::InProgress {
            dir: PathBuf::from("/f/.func/builds/by-hash/abc"),
        };
        let outcome = ExecutionOutcome::from_build_error(&err);
        assert_eq!(outcome.status, CommandStatus::UserError);
        assert_eq!(outcome.status.exit_code(), 1);
        assert_eq!(outcome.details["code"], "FP101");
        assert!(hint_from_details(&outcome.details).is_some());
    }

    #[test]
    fn host_failures_exit_with_two() {
        let err = BuildError::Invariant("layers out of step".into());
        let outcome = ExecutionOutcome::from_build_error(&err);
        assert_eq!(outcome.status.exit_code(), 2);
        let payload = to_json_response("build", &outcome);
        assert_eq!(payload["status"], "failure");
        assert_eq!(payload["command"], "build");
    }
}
