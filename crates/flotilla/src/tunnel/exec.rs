//! Exec/terminal bridge.
//!
//! Interactive shells are correlated by a server-generated exec id, a
//! namespace of its own, fully independent of request ids. The bridge
//! only maps exec ids to local client channels; it never touches the
//! unary or stream pending maps.

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;

/// Parameters for opening an exec session.
#[derive(Debug, Clone)]
pub struct ExecParams {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events delivered to the local client (the dashboard terminal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecClientEvent {
    /// The remote PTY is allocated.
    Ready,
    /// Decoded terminal output, forwarded verbatim.
    Output(Vec<u8>),
    /// The session is over. Last event on the channel.
    End { reason: String },
}

/// Input from the local client toward the remote terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Caller-side handle to an exec session. Dropping it counts as the
/// local client disconnecting: the agent receives
/// `exec_end{reason:"user_closed"}` and the session is removed.
#[derive(Debug)]
pub struct ExecHandle {
    exec_id: String,
    input: mpsc::Sender<ExecInput>,
}

impl ExecHandle {
    pub(crate) fn new(exec_id: String, input: mpsc::Sender<ExecInput>) -> Self {
        Self { exec_id, input }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Forward input or a resize. Returns false once the session is gone.
    pub async fn send(&self, input: ExecInput) -> bool {
        self.input.send(input).await.is_ok()
    }
}

/// One registered exec session.
#[derive(Debug)]
pub struct ExecSession {
    pub exec_id: String,
    pub environment_id: String,
    pub client: mpsc::Sender<ExecClientEvent>,
}

/// Table of live exec sessions.
#[derive(Debug, Default)]
pub struct ExecBridge {
    sessions: DashMap<String, ExecSession>,
}

impl ExecBridge {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: ExecSession) {
        info!(
            "Registered exec session {} on environment {}",
            session.exec_id, session.environment_id
        );
        self.sessions.insert(session.exec_id.clone(), session);
    }

    pub fn remove(&self, exec_id: &str) -> Option<ExecSession> {
        self.sessions.remove(exec_id).map(|(_, s)| s)
    }

    pub fn contains(&self, exec_id: &str) -> bool {
        self.sessions.contains_key(exec_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The remote PTY came up.
    pub fn forward_ready(&self, exec_id: &str) {
        match self.sessions.get(exec_id) {
            Some(session) => {
                let _ = session.client.try_send(ExecClientEvent::Ready);
            }
            None => debug!("Dropping exec_ready for unknown session {exec_id}"),
        }
    }

    /// Forward decoded output bytes to the local client. Strays for
    /// already-closed sessions are dropped without error.
    pub fn forward_output(&self, exec_id: &str, bytes: Vec<u8>) {
        match self.sessions.get(exec_id) {
            Some(session) => {
                if session.client.try_send(ExecClientEvent::Output(bytes)).is_err() {
                    warn!("Exec client for {exec_id} not keeping up, dropping output");
                }
            }
            None => debug!("Dropping exec_output for unknown session {exec_id}"),
        }
    }

    /// Close a session from the agent side (or on teardown). Removes it
    /// and delivers the terminal event to the client.
    pub fn end_session(&self, exec_id: &str, reason: String) {
        if let Some(session) = self.remove(exec_id) {
            info!(
                "Exec session {} on environment {} ended: {}",
                exec_id, session.environment_id, reason
            );
            tokio::spawn(async move {
                let _ = session.client.send(ExecClientEvent::End { reason }).await;
            });
        } else {
            debug!("Dropping exec_end for unknown session {exec_id}");
        }
    }

    /// Tear down every session bound to an environment. Returns the
    /// closed exec ids.
    pub fn close_for_environment(&self, environment_id: &str, reason: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().environment_id == environment_id)
            .map(|entry| entry.key().clone())
            .collect();
        for exec_id in &ids {
            self.end_session(exec_id, reason.to_string());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(exec_id: &str, env: &str) -> (ExecSession, mpsc::Receiver<ExecClientEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ExecSession {
                exec_id: exec_id.to_string(),
                environment_id: env.to_string(),
                client: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_output_reaches_client() {
        let bridge = ExecBridge::new();
        let (sess, mut rx) = session("e-1", "env-1");
        bridge.insert(sess);

        bridge.forward_ready("e-1");
        bridge.forward_output("e-1", b"$ ".to_vec());

        assert_eq!(rx.recv().await.unwrap(), ExecClientEvent::Ready);
        assert_eq!(rx.recv().await.unwrap(), ExecClientEvent::Output(b"$ ".to_vec()));
    }

    #[tokio::test]
    async fn test_stray_output_after_end_is_dropped() {
        let bridge = ExecBridge::new();
        let (sess, mut rx) = session("e-1", "env-1");
        bridge.insert(sess);

        bridge.end_session("e-1", "user_closed".to_string());
        assert_eq!(
            rx.recv().await.unwrap(),
            ExecClientEvent::End {
                reason: "user_closed".to_string()
            }
        );
        assert!(bridge.is_empty());

        // Stray output for the removed session: dropped without error.
        bridge.forward_output("e-1", b"late".to_vec());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_for_environment_scopes_by_env() {
        let bridge = ExecBridge::new();
        let (s1, mut rx1) = session("e-1", "env-1");
        let (s2, mut rx2) = session("e-2", "env-2");
        bridge.insert(s1);
        bridge.insert(s2);

        let closed = bridge.close_for_environment("env-1", "Connection closed");
        assert_eq!(closed, vec!["e-1".to_string()]);
        assert!(matches!(
            rx1.recv().await,
            Some(ExecClientEvent::End { .. })
        ));
        assert!(bridge.contains("e-2"));
        assert!(rx2.try_recv().is_err());
    }
}
