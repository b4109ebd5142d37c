//! Synchronous external process execution
//!
//! Every tool invocation blocks until completion; a non-zero exit status is
//! fatal to the build.

use std::ffi::OsStr;
use std::process::Command;

use crate::error::ToolError;

/// Run a tool to completion, discarding its output on success
pub fn run<I, S>(tool: &str, args: I) -> Result<(), ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_capture(tool, args).map(|_| ())
}

/// Run a tool to completion and return its stdout
pub fn run_capture<I, S>(tool: &str, args: I) -> Result<String, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ToolError::Spawn {
            tool: tool.to_string(),
            error: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Verify that every required tool is reachable in PATH
pub fn require_tools(tools: &[&str]) -> Result<(), ToolError> {
    for tool in tools {
        which::which(tool).map_err(|_| ToolError::NotFound {
            tool: (*tool).to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported() {
        let err = run("imgforge-no-such-tool", ["--version"]).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn nonzero_exit_is_fatal() {
        let err = run("false", Vec::<&str>::new()).unwrap_err();
        match err {
            ToolError::Failed { tool, status, .. } => {
                assert_eq!(tool, "false");
                assert_ne!(status, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn capture_returns_stdout() {
        let out = run_capture("echo", ["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
