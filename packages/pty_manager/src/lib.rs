//! PTY Manager - process adapter and scrollback buffer for PTY sessions
//!
//! This crate spawns interactive programs on pseudo-terminals and exposes
//! them through a small trait seam ([`PtyBackend`] / [`PtyControl`]) so that
//! whatever owns session lifetimes can be tested without real processes.
//! It has no HTTP dependencies and no knowledge of what the programs are.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{NativePtyBackend, PtyBackend, PtyConfig, PtyEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = NativePtyBackend::new();
//!
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         args: vec![],
//!         working_dir: Some("/tmp".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let mut spawned = backend.spawn(config).unwrap();
//!
//!     // Queue input for the process
//!     spawned.control.write(b"echo hello; exit\n".to_vec()).unwrap();
//!
//!     while let Some(event) = spawned.events.recv().await {
//!         match event {
//!             PtyEvent::Output(data) => print!("{}", String::from_utf8_lossy(&data)),
//!             PtyEvent::Exited(status) => {
//!                 println!("exited: {:?}", status);
//!                 break;
//!             }
//!         }
//!     }
//! }
//! ```

mod backend;
mod error;
pub mod pty;
pub mod ring_buffer;

pub use backend::{ExitStatus, PtyBackend, PtyConfig, PtyControl, PtyEvent, SpawnedPty};
pub use error::{PtyError, SpawnError};
pub use pty::{NativePty, NativePtyBackend};
pub use ring_buffer::OutputRingBuffer;
