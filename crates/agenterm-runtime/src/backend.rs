//! Abstract terminal backend contract (SPEC_FULL.md §2 C2, §6 "Terminal
//! Backend contract"). Anything that can create/destroy a named session
//! window, push raw bytes or a named key, resize and capture output
//! satisfies this trait; the scheduler, session manager and monitor never
//! see the concrete process/multiplexer underneath it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub exists: bool,
    pub output: String,
}

/// Named keys a backend must understand, independent of send_key's raw
/// string spelling (decoded by the session manager, see SPEC_FULL.md §4.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    Submit,
    Interrupt,
    Escape,
    Tab,
}

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Creates a session + window rooted at `workdir`, returning the window
    /// id. The session name is the caller's chosen terminal_session_name.
    async fn create(&self, session_name: &str, workdir: &str) -> anyhow::Result<String>;

    /// Whether the session (and at least one window) is still alive.
    async fn exists(&self, session_name: &str) -> anyhow::Result<bool>;

    async fn send_text(&self, session_name: &str, window_id: &str, text: &str) -> anyhow::Result<()>;

    async fn send_key(&self, session_name: &str, window_id: &str, key: NamedKey) -> anyhow::Result<()>;

    /// Sends raw bytes verbatim, used by auto-accept decoding (SPEC_FULL.md
    /// §4.4) where the sequence isn't one of the named keys.
    async fn send_raw(&self, session_name: &str, window_id: &str, bytes: &[u8]) -> anyhow::Result<()>;

    async fn resize(&self, session_name: &str, window_id: &str, cols: u32, rows: u32) -> anyhow::Result<()>;

    /// Captures the last `lines` lines of output (or the whole ring buffer
    /// if fewer are available).
    async fn capture(&self, session_name: &str, window_id: &str, lines: usize) -> anyhow::Result<BackendSnapshot>;

    async fn destroy(&self, session_name: &str) -> anyhow::Result<()>;
}
