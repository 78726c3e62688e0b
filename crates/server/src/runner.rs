use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::storage::BlobReader;

/// Driver for the external media tools (`ffprobe`, `ffmpeg`).
///
/// Knows nothing about codecs, RTSP, or blob storage: it wires a readable
/// source to the tool's stdin, logs stderr, and exposes stdout either as a
/// collected buffer or as a streaming handle. Every spawned child is killed
/// when its cancellation token fires (and on drop, as a backstop).
#[derive(Debug, Clone, Copy, Default)]
pub struct Runner;

impl Runner {
    /// Run the tool to completion and return its stdout.
    ///
    /// A non-zero exit status is a failure. Stderr is logged at debug level.
    pub async fn run_collected(
        &self,
        app: &str,
        args: &[&str],
        input: Option<BlobReader>,
    ) -> Result<Vec<u8>> {
        let mut child = spawn(app, args, input.is_some())?;
        feed_stdin(&mut child, input);
        log_stderr(app, &mut child);

        let mut stdout = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            // drain before wait() so the child never blocks on a full pipe
            out.read_to_end(&mut stdout).await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(RelayError::Transient(format!("{app} exited with {status}")));
        }
        Ok(stdout)
    }

    /// Start the tool and hand back its stdout for the caller to drain.
    ///
    /// End of stream on the handle is the end-of-output signal; call
    /// [`StreamingChild::wait`] afterwards to surface the exit status.
    pub fn run_streaming(
        &self,
        app: &str,
        args: &[&str],
        input: Option<BlobReader>,
        cancel: CancellationToken,
    ) -> Result<StreamingChild> {
        let mut child = spawn(app, args, input.is_some())?;
        feed_stdin(&mut child, input);
        log_stderr(app, &mut child);

        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::Transient(format!("{app} spawned without a stdout pipe"))
        })?;

        Ok(StreamingChild {
            app: app.to_string(),
            stdout: Some(stdout),
            child,
            cancel,
        })
    }

    /// Run a long-lived tool whose output goes elsewhere (e.g. an RTSP URL),
    /// blocking until it exits or the token is cancelled. Cancellation kills
    /// the child and is not reported as a failure.
    pub async fn run_to_completion(
        &self,
        app: &str,
        args: &[&str],
        input: Option<BlobReader>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut child = spawn(app, args, input.is_some())?;
        feed_stdin(&mut child, input);
        log_stderr(app, &mut child);

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(RelayError::Transient(format!("{app} exited with {status}")));
                }
                Ok(())
            }
            _ = cancel.cancelled() => {
                tracing::debug!(tool = app, "killing child on cancellation");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(())
            }
        }
    }
}

/// A running tool whose stdout the caller drains.
pub struct StreamingChild {
    app: String,
    stdout: Option<ChildStdout>,
    child: Child,
    cancel: CancellationToken,
}

impl StreamingChild {
    /// Take the stdout handle. Yields `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the child to exit, killing it if the token fires first.
    pub async fn wait(&mut self) -> Result<()> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(RelayError::Transient(format!(
                        "{} exited with {status}",
                        self.app
                    )));
                }
                Ok(())
            }
            _ = self.cancel.cancelled() => {
                tracing::debug!(tool = %self.app, "killing child on cancellation");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                Ok(())
            }
        }
    }
}

fn spawn(app: &str, args: &[&str], piped_stdin: bool) -> Result<Child> {
    let mut cmd = Command::new(app);
    cmd.args(args)
        .stdin(if piped_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(tool = app, ?args, "spawning");
    cmd.spawn()
        .map_err(|e| RelayError::Transient(format!("failed to spawn {app}: {e}")))
}

fn feed_stdin(child: &mut Child, input: Option<BlobReader>) {
    let Some(mut input) = input else { return };
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    tokio::spawn(async move {
        // A closed pipe is routine: ffprobe stops reading once it has the
        // stream headers, and a killed ffmpeg drops its end mid-copy.
        let _ = tokio::io::copy(&mut input, &mut stdin).await;
        let _ = stdin.shutdown().await;
    });
}

fn log_stderr(app: &str, child: &mut Child) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let tool = app.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(tool = %tool, "{line}");
        }
    });
}
