//! Shell methods.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use launchpad_rpc::{MethodTable, Params, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Methods mounted under `shell`.
#[must_use]
pub fn methods() -> MethodTable {
    let mut methods = MethodTable::new();
    methods.register("run_shell_command", |_session, params: Params| async move {
        let shell_command: String = params.parse(0, "shell_command")?;
        let current_dir: String = params.parse(1, "current_dir")?;
        Ok(Value::Text(
            run_shell_command(&shell_command, &current_dir).await,
        ))
    });
    methods
}

/// Run `shell_command` in `current_dir` and return stdout and stderr as one
/// text, in the order the chunks arrived.
///
/// The command line is split with shell quoting rules but not run through a
/// shell. Failures to start the command are reported as the output. The
/// result always ends with a newline.
pub async fn run_shell_command(shell_command: &str, current_dir: &str) -> String {
    let mut output = match run(shell_command, &working_dir(current_dir)).await {
        Ok(output) => output,
        Err(message) => message,
    };
    if !output.ends_with('\n') {
        output.push('\n');
    }
    output
}

fn working_dir(current_dir: &str) -> PathBuf {
    if cfg!(windows) && current_dir == "/" {
        PathBuf::from("C:/")
    } else {
        PathBuf::from(current_dir)
    }
}

async fn run(shell_command: &str, current_dir: &Path) -> Result<String, String> {
    let words = shlex::split(shell_command).ok_or_else(|| "unbalanced quotes".to_string())?;
    let Some((program, args)) = words.split_first() else {
        return Err("empty command".to_string());
    };

    debug!("Running {:?} in {}", words, current_dir.display());
    let mut child = Command::new(program)
        .args(args)
        .current_dir(current_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("{program}: {e}"))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err("output pipes unavailable".to_string());
    };
    let combined = read_combined(stdout, stderr)
        .await
        .map_err(|e| e.to_string())?;
    let status = child.wait().await.map_err(|e| e.to_string())?;
    debug!("{} exited with {}", program, status);

    Ok(String::from_utf8_lossy(&combined).into_owned())
}

async fn read_combined(mut stdout: ChildStdout, mut stderr: ChildStderr) -> io::Result<Vec<u8>> {
    let mut combined = Vec::new();
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => {
                let n = read?;
                if n == 0 {
                    out_open = false;
                } else {
                    combined.extend_from_slice(&out_buf[..n]);
                }
            }
            read = stderr.read(&mut err_buf), if err_open => {
                let n = read?;
                if n == 0 {
                    err_open = false;
                } else {
                    combined.extend_from_slice(&err_buf[..n]);
                }
            }
        }
    }

    Ok(combined)
}
