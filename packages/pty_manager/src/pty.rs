use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{ExitStatus, PtyBackend, PtyConfig, PtyControl, PtyEvent, SpawnedPty};
use crate::error::{PtyError, SpawnError};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Bound on undelivered events; a full channel pauses the reader thread.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Spawns real processes on OS pseudo-terminals via portable-pty.
#[derive(Clone, Debug, Default)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, config: PtyConfig) -> Result<SpawnedPty, SpawnError> {
        let (pty, events) = NativePty::spawn(config)?;
        Ok(SpawnedPty {
            control: Arc::new(pty),
            events,
        })
    }
}

/// Handle to a process running on a native PTY.
///
/// Output is pumped by a blocking reader thread and input is drained by a
/// blocking writer thread, so no call here waits on the child.
pub struct NativePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl NativePty {
    pub fn spawn(config: PtyConfig) -> Result<(Self, mpsc::Receiver<PtyEvent>), SpawnError> {
        if let Some(dir) = &config.working_dir {
            if !Path::new(dir).is_dir() {
                return Err(SpawnError::InvalidWorkingDirectory(dir.clone()));
            }
        }

        let program = resolve_program(&config.command)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::PtyUnavailable(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&config.args);

        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            program, config.args
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            SpawnError::SpawnFailed(e.to_string())
        })?;
        // The child holds its own copy; ours would keep the PTY open past exit
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(SpawnError::PtyUnavailable(e.to_string()));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(SpawnError::PtyUnavailable(e.to_string()));
            }
        };

        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        if let Err(e) = spawn_writer_thread(writer, input_rx, pid) {
            let _ = child.kill();
            return Err(e);
        }
        spawn_reader_thread(reader, child, events_tx, exited.clone(), pid)?;

        let pty = NativePty {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            exited,
            pid,
        };

        Ok((pty, events_rx))
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl PtyControl for NativePty {
    fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }
        self.input_tx
            .send(data)
            .map_err(|_| PtyError::WriteFailed("PTY writer has shut down".into()))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }
        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::ResizeFailed("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        debug!(pid = ?self.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    fn terminate(&self, graceful: bool) -> Result<(), PtyError> {
        // Never signal a PID that may already have been recycled
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let signal = if graceful {
                Signal::SIGTERM
            } else {
                Signal::SIGKILL
            };
            return match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(PtyError::KillFailed(e.to_string())),
            };
        }

        let _ = graceful;
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| PtyError::KillFailed("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Resolve a bare command name on PATH; paths are checked as given.
fn resolve_program(command: &str) -> Result<String, SpawnError> {
    if command.trim().is_empty() {
        return Err(SpawnError::CommandNotFound(command.to_string()));
    }
    if command.contains('/') {
        return if Path::new(command).is_file() {
            Ok(command.to_string())
        } else {
            Err(SpawnError::CommandNotFound(command.to_string()))
        };
    }
    which::which(command)
        .map(|path| path.to_string_lossy().to_string())
        .map_err(|_| SpawnError::CommandNotFound(command.to_string()))
}

fn spawn_writer_thread(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pid: Option<u32>,
) -> Result<(), SpawnError> {
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!(pid = ?pid, "Error writing PTY input: {}", e);
                    break;
                }
            }
            debug!(pid = ?pid, "PTY writer thread exiting");
        })
        .map(|_| ())
        .map_err(|e| SpawnError::SpawnFailed(e.to_string()))
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    events_tx: mpsc::Sender<PtyEvent>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
) -> Result<(), SpawnError> {
    let mut killer = child.clone_killer();
    let spawned = std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        info!(pid = ?pid, "PTY EOF detected - process has exited");
                        break;
                    }
                    Ok(n) => {
                        if events_tx
                            .blocking_send(PtyEvent::Output(buffer[..n].to_vec()))
                            .is_err()
                        {
                            debug!(pid = ?pid, "PTY event receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side is closed
                        debug!(pid = ?pid, "PTY read ended: {}", e);
                        break;
                    }
                }
            }

            let status = match child.wait() {
                Ok(status) => match status.signal() {
                    Some(signal) => ExitStatus::with_signal(signal),
                    None => ExitStatus::with_code(status.exit_code() as i32),
                },
                Err(e) => {
                    warn!(pid = ?pid, "Failed to reap PTY process: {}", e);
                    ExitStatus {
                        code: None,
                        signal: None,
                    }
                }
            };
            exited.store(true, Ordering::SeqCst);
            info!(pid = ?pid, status = ?status, "PTY process exited");
            let _ = events_tx.blocking_send(PtyEvent::Exited(status));
        });

    match spawned {
        Ok(_) => Ok(()),
        Err(e) => {
            let _ = killer.kill();
            Err(SpawnError::SpawnFailed(e.to_string()))
        }
    }
}
