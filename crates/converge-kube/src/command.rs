//! Running external command line clients

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::Error;

/// Exit status and combined stdout/stderr of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Stdout followed by stderr
    pub output: String,
}

/// Run `program` to completion, optionally feeding `stdin`
///
/// A non-zero exit is reported through [`CommandOutput::success`], not as an
/// error; only a failure to spawn or talk to the process is an error.
pub async fn run_command(
    program: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, Error> {
    debug!(program = %program, command = %args.first().copied().unwrap_or(""), "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::command(program, format!("failed to spawn: {}", e)))?;

    if let (Some(body), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(body)
            .await
            .map_err(|e| Error::command(program, format!("failed to write stdin: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::command(program, e.to_string()))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CommandOutput {
        success: output.status.success(),
        output: combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let err = run_command("converge-no-such-program", &["version"], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { ref program, .. } if program == "converge-no-such-program"));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_is_echoed_and_exit_status_kept() {
        let out = run_command("cat", &[], Some(b"{\"kind\":\"Error\"}")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, "{\"kind\":\"Error\"}");

        let out = run_command("false", &[], None).await.unwrap();
        assert!(!out.success);
    }
}
