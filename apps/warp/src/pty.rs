//! The shared pty: a login shell spawned under a pseudo-terminal, bridged to
//! the async world with channels. portable-pty hands out blocking reader and
//! writer objects, so each side gets its own thread.

use std::io::{Read, Write};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warp_proto::WindowSize;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("failed to resize pty: {0}")]
    Resize(String),
}

pub struct LocalPty {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::Sender<Bytes>,
    output_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    exited: CancellationToken,
}

impl LocalPty {
    /// Spawn `shell -l` under a fresh pty with the given size and extra
    /// environment.
    pub fn spawn(
        shell: &str,
        size: WindowSize,
        envs: &[(&str, String)],
    ) -> Result<LocalPty, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Open(err.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-l");
        for (key, value) in envs {
            cmd.env(key, value);
        }
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| PtyError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| PtyError::Open(err.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|err| PtyError::Open(err.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "warp::pty", "pty reader thread exiting");
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(64);
        std::thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if writer.write_all(&chunk).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
            debug!(target: "warp::pty", "pty writer thread exiting");
        });

        let exited = CancellationToken::new();
        {
            let exited = exited.clone();
            std::thread::spawn(move || {
                let _ = child.wait();
                exited.cancel();
            });
        }

        Ok(LocalPty {
            master: StdMutex::new(pair.master),
            input_tx,
            output_rx: StdMutex::new(Some(output_rx)),
            exited,
        })
    }

    /// The pty output channel. Can only be taken once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().unwrap().take()
    }

    /// Sender feeding the shell's stdin. Both the local stdin worker and the
    /// network worker write here; interleaving is at chunk granularity.
    pub fn input(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }

    /// Apply a new window size to the pty. The kernel delivers `SIGWINCH` to
    /// the shell's process group as part of the resize ioctl.
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Resize(err.to_string()))
    }

    /// Cancelled when the shell process exits.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn default_shell() -> String {
        std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}
