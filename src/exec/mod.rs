//! External process execution with timeouts and line streaming.
//!
//! Every git and docker invocation in the system goes through here so that
//! timeout handling, log capture and error classification are uniform.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr}")]
    NonZero {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// A sink for live output lines. Sends are non-blocking; a full channel
/// drops the line, since the caller also receives the captured output.
pub type LineSink = mpsc::Sender<String>;

fn program_name(argv: &[String]) -> String {
    argv.first().cloned().unwrap_or_else(|| "<empty>".to_string())
}

/// Run a command to completion, capturing stdout and stderr.
///
/// A non-zero exit is an error; callers that tolerate failure (inspect of a
/// missing container, best-effort cleanup) match on `ExecError::NonZero`.
pub async fn run(cwd: &Path, timeout: Duration, argv: &[String]) -> Result<CommandOutput, ExecError> {
    let program = program_name(argv);
    let start = Instant::now();

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Killed if the timeout drops the in-flight wait below.
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ExecError::Io {
            program: program.clone(),
            source,
        })?,
        Err(_) => {
            return Err(ExecError::Timeout { program, timeout });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        return Err(ExecError::NonZero {
            program,
            code: exit_code,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

/// Run a command and push each stdout/stderr line into `sink` as it appears.
///
/// Returns the captured output as well, so the database log copy does not
/// depend on the sink keeping up.
pub async fn run_streaming(
    cwd: &Path,
    timeout: Duration,
    argv: &[String],
    sink: LineSink,
) -> Result<CommandOutput, ExecError> {
    let program = program_name(argv);
    let start = Instant::now();

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout_pipe = child.stdout.take().expect("stdout requested above");
    let stderr_pipe = child.stderr.take().expect("stderr requested above");

    let stdout_task = spawn_line_pump(stdout_pipe, sink.clone());
    let stderr_task = spawn_line_pump(stderr_pipe, sink);

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result.map_err(|source| ExecError::Io {
            program: program.clone(),
            source,
        })?,
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(ExecError::Timeout { program, timeout });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);

    if !status.success() {
        return Err(ExecError::NonZero {
            program,
            code: exit_code,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

fn spawn_line_pump<R>(reader: R, sink: LineSink) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut captured = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            captured.push_str(&line);
            captured.push('\n');
            if sink.try_send(line).is_err() {
                debug!("Line sink full, dropping output line");
            }
        }
        captured
    })
}

/// Characters never allowed in user-supplied path fragments.
const FORBIDDEN: &[char] = &[
    ';', '&', '|', '$', '`', '(', ')', '<', '>', '"', '\'', '\\', '\n', '\r', '\0', '*', '?',
];

/// Clean a user-supplied path fragment (workdir, dockerfile path) before it
/// is joined onto a checkout directory. Strips traversal components and
/// shell metacharacters rather than erroring, matching what the pipeline
/// needs: a best-effort safe relative path.
pub fn sanitize_path_fragment(fragment: &str) -> String {
    fragment
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".." && *part != "~" && *part != ".")
        .map(|part| {
            part.chars()
                .filter(|c| !FORBIDDEN.contains(c))
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run(
            Path::new("."),
            Duration::from_secs(5),
            &argv(&["echo", "hello"]),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_is_error() {
        let err = run(Path::new("."), Duration::from_secs(5), &argv(&["false"]))
            .await
            .unwrap_err();
        match err {
            ExecError::NonZero { code, .. } => assert_ne!(code, 0),
            other => panic!("expected NonZero, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let err = run(
            Path::new("."),
            Duration::from_millis(100),
            &argv(&["sleep", "5"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let err = run(
            Path::new("."),
            Duration::from_secs(1),
            &argv(&["definitely-not-a-real-binary-xyz"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_streaming_delivers_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let out = run_streaming(
            Path::new("."),
            Duration::from_secs(5),
            &argv(&["sh", "-c", "echo one; echo two"]),
            tx,
        )
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["one", "two"]);
        assert!(out.stdout.contains("one\n"));
        assert!(out.stdout.contains("two\n"));
    }

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_path_fragment("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path_fragment("~/secrets"), "secrets");
        assert_eq!(sanitize_path_fragment("services/api"), "services/api");
    }

    #[test]
    fn test_sanitize_strips_shell_metacharacters() {
        assert_eq!(sanitize_path_fragment("dir;rm -rf /"), "dirrm -rf");
        assert_eq!(sanitize_path_fragment("a$(whoami)b"), "awhoamib");
        assert_eq!(sanitize_path_fragment("./plain"), "plain");
    }
}
