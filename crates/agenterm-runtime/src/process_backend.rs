//! In-process `TerminalBackend` over spawned child processes: one shell
//! child per terminal session, matching the capability set in SPEC_FULL.md
//! §6 exactly. Grounded in the teacher's single-child-per-session PTY
//! manager, generalized to named session+window addressing, resize and
//! send-key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{BackendSnapshot, NamedKey, TerminalBackend};

const OUTPUT_CAP_BYTES: usize = 200_000;
const OUTPUT_TRUNCATE_TO: usize = 100_000;

#[derive(Clone)]
struct ProcessSession {
    window_id: String,
    output: Arc<RwLock<String>>,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Child>>,
}

/// Spawns `shell` (the project's configured shell, default the platform
/// default) as the single window of each terminal session.
pub struct ProcessBackend {
    shell: String,
    sessions: Arc<RwLock<HashMap<String, ProcessSession>>>,
}

impl ProcessBackend {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(default_shell())
    }
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

#[cfg(not(unix))]
fn default_shell() -> String {
    "powershell".to_string()
}

#[async_trait]
impl TerminalBackend for ProcessBackend {
    async fn create(&self, session_name: &str, workdir: &str) -> anyhow::Result<String> {
        let mut child = Command::new(&self.shell)
            .current_dir(workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr unavailable"))?;

        let window_id = format!("{session_name}:0");
        let output = Arc::new(RwLock::new(String::new()));
        tokio::spawn(read_stream(output.clone(), stdout));
        tokio::spawn(read_stream(output.clone(), stderr));

        self.sessions.write().await.insert(
            session_name.to_string(),
            ProcessSession {
                window_id: window_id.clone(),
                output,
                stdin: Arc::new(Mutex::new(stdin)),
                child: Arc::new(Mutex::new(child)),
            },
        );
        Ok(window_id)
    }

    async fn exists(&self, session_name: &str) -> anyhow::Result<bool> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_name) else {
            return Ok(false);
        };
        Ok(session.child.lock().await.id().is_some())
    }

    async fn send_text(&self, session_name: &str, _window_id: &str, text: &str) -> anyhow::Result<()> {
        let session = self.get(session_name).await?;
        let mut stdin = session.stdin.lock().await;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_key(&self, session_name: &str, _window_id: &str, key: NamedKey) -> anyhow::Result<()> {
        let bytes: &[u8] = match key {
            NamedKey::Submit => b"\n",
            NamedKey::Interrupt => b"\x03",
            NamedKey::Escape => b"\x1b",
            NamedKey::Tab => b"\t",
        };
        let session = self.get(session_name).await?;
        let mut stdin = session.stdin.lock().await;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_raw(&self, session_name: &str, _window_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let session = self.get(session_name).await?;
        let mut stdin = session.stdin.lock().await;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn resize(&self, session_name: &str, _window_id: &str, cols: u32, rows: u32) -> anyhow::Result<()> {
        if cols == 0 || rows == 0 {
            anyhow::bail!("resize requires cols>0 and rows>0");
        }
        // A plain spawned child has no pty to resize; this backend treats
        // resize as a no-op liveness check so the contract still applies
        // uniformly across backends.
        self.get(session_name).await?;
        Ok(())
    }

    async fn capture(&self, session_name: &str, _window_id: &str, lines: usize) -> anyhow::Result<BackendSnapshot> {
        let session = self.get(session_name).await?;
        let full = session.output.read().await.clone();
        let exists = session.child.lock().await.id().is_some();
        let output = last_n_lines(&full, lines);
        Ok(BackendSnapshot { exists, output })
    }

    async fn destroy(&self, session_name: &str) -> anyhow::Result<()> {
        let session = self.sessions.write().await.remove(session_name);
        let Some(session) = session else {
            return Ok(());
        };
        let mut child = session.child.lock().await;
        let _ = child.kill().await;
        Ok(())
    }
}

impl ProcessBackend {
    async fn get(&self, session_name: &str) -> anyhow::Result<ProcessSession> {
        self.sessions
            .read()
            .await
            .get(session_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such terminal session: {session_name}"))
    }
}

fn last_n_lines(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

async fn read_stream(output: Arc<RwLock<String>>, mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
    let mut buf = vec![0_u8; 4096];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let chunk = String::from_utf8_lossy(&buf[..read]).to_string();
        let mut out = output.write().await;
        out.push_str(&chunk);
        if out.len() > OUTPUT_CAP_BYTES {
            let cut = out.len().saturating_sub(OUTPUT_TRUNCATE_TO);
            let tail = out.split_off(cut);
            *out = tail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_n_lines_keeps_only_the_tail() {
        let text = "one\ntwo\nthree\nfour";
        assert_eq!(last_n_lines(text, 2), "three\nfour");
        assert_eq!(last_n_lines(text, 0), "");
        assert_eq!(last_n_lines(text, 100), text);
    }

    #[tokio::test]
    async fn create_send_capture_destroy_round_trip() {
        let backend = ProcessBackend::new("/bin/sh");
        let window = backend.create("ses-echo", "/tmp").await.expect("create");
        backend
            .send_text("ses-echo", &window, "echo hello\n")
            .await
            .expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let snapshot = backend.capture("ses-echo", &window, 50).await.expect("capture");
        assert!(snapshot.output.contains("hello"));
        backend.destroy("ses-echo").await.expect("destroy");
    }
}
