//! Interactive container shells over a real PTY.
//!
//! The agent allocates a pseudo-terminal, runs `docker exec -it` inside it,
//! and bridges the PTY to async channels: stdin writes are never dropped
//! (interactive loss is unacceptable), output is read in 4 KiB chunks, and
//! the child's exit code is reported once at the end.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const READ_BUFFER: usize = 4096;
const OUTPUT_CHANNEL: usize = 64;
const INPUT_CHANNEL: usize = 64;

pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    input: mpsc::Sender<Vec<u8>>,
    output: Option<mpsc::Receiver<Vec<u8>>>,
    exit: Option<oneshot::Receiver<i32>>,
}

impl PtySession {
    /// Spawn `docker exec -it <container> <shell>` under a fresh PTY.
    pub fn spawn(container_id: &str, shell: &str, cols: u16, rows: u16) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to allocate PTY")?;

        let mut cmd = CommandBuilder::new("docker");
        cmd.args(["exec", "-it", container_id, shell]);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn docker exec under PTY")?;
        drop(pair.slave);

        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let mut writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL);
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();

        // Reader thread: PTY -> output channel, then reap the child.
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            let code = child
                .wait()
                .map(|status| status.exit_code() as i32)
                .unwrap_or(-1);
            let _ = exit_tx.send(code);
            debug!(code, "PTY child exited");
        });

        // Writer thread: input channel -> PTY.
        std::thread::spawn(move || {
            while let Some(bytes) = input_rx.blocking_recv() {
                if writer.write_all(&bytes).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            master: pair.master,
            killer,
            input: input_tx,
            output: Some(output_rx),
            exit: Some(exit_rx),
        })
    }

    /// Sender for stdin bytes. Sends block when the PTY is busy; input is
    /// never dropped.
    pub fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input.clone()
    }

    /// The output chunk stream; yields until the child exits.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output.take()
    }

    /// Resolves once with the child's exit code.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<i32>> {
        self.exit.take()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")
    }

    /// Kill the child; the reader thread then unwinds and reports exit.
    pub fn kill(&mut self) {
        let _ = self.killer.kill();
    }
}
