//! Per-miner session state and the live session registry.
//!
//! All frames to a miner go through the session's writer mutex, so a miner
//! never observes interleaved output. The read deadline is a rolling
//! instant, re-armed on activity and after each successful job push.

use crate::stratum::protocol::{ErrorReply, PushMessage, RpcResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(90);

pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Session {
    pub id: Uuid,
    pub ip: String,
    writer: Mutex<SessionWriter>,
    login: StdRwLock<Option<String>>,
    worker: StdRwLock<String>,
    last_activity: StdMutex<Instant>,
    last_ping: StdMutex<Instant>,
    read_deadline: StdMutex<Instant>,
    ping_timeout: Duration,
    shutdown: Notify,
    closed: AtomicBool,
}

impl Session {
    pub fn new(ip: String, writer: SessionWriter, read_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            ip,
            writer: Mutex::new(writer),
            login: StdRwLock::new(None),
            worker: StdRwLock::new("0".to_string()),
            last_activity: StdMutex::new(now),
            last_ping: StdMutex::new(now),
            read_deadline: StdMutex::new(now + read_timeout),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    async fn write_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    fn encode(value: &impl serde::Serialize) -> io::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        frame.push(b'\n');
        Ok(frame)
    }

    pub async fn send_result(&self, id: Value, result: Value) -> io::Result<()> {
        self.write_frame(Self::encode(&RpcResponse::result(id, result))?).await
    }

    pub async fn send_error(&self, id: Value, reply: ErrorReply) -> io::Result<()> {
        self.write_frame(Self::encode(&RpcResponse::error(id, reply))?).await
    }

    pub async fn push_job(&self, payload: Value) -> io::Result<()> {
        self.write_frame(Self::encode(&PushMessage::job(payload))?).await
    }

    /// Sets the login; only the first successful login sticks.
    pub fn set_login(&self, login: String) {
        let mut slot = self.login.write().unwrap();
        if slot.is_none() {
            *slot = Some(login);
        }
    }

    pub fn login(&self) -> Option<String> {
        self.login.read().unwrap().clone()
    }

    pub fn set_worker(&self, worker: String) {
        *self.worker.write().unwrap() = worker;
    }

    pub fn worker(&self) -> String {
        self.worker.read().unwrap().clone()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn mark_ping(&self) {
        *self.last_ping.lock().unwrap() = Instant::now();
    }

    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn extend_deadline(&self, timeout: Duration) {
        *self.read_deadline.lock().unwrap() = Instant::now() + timeout;
    }

    pub fn deadline(&self) -> Instant {
        *self.read_deadline.lock().unwrap()
    }

    /// Idempotent: wakes the read loop once, further calls are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn closed_signal(&self) {
        self.shutdown.notified().await
    }

    /// Half-closes the connection so the peer observes EOF.
    pub async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdRwLock<HashMap<Uuid, std::sync::Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: std::sync::Arc<Session>) {
        self.sessions.write().unwrap().insert(session.id, session);
    }

    /// Idempotent removal.
    pub fn remove(&self, id: Uuid) -> bool {
        self.sessions.write().unwrap().remove(&id).is_some()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.read().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short read-lock snapshot for the broadcaster.
    pub fn snapshot(&self) -> Vec<std::sync::Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Sweeps sessions idle past their ping timeout under one write lock,
    /// returning them for closing.
    pub fn reap_idle(&self) -> Vec<std::sync::Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap();
        let mut reaped = Vec::new();
        sessions.retain(|_, session| {
            if session.idle_for() > session.ping_timeout() {
                reaped.push(session.clone());
                false
            } else {
                true
            }
        });
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    fn session_pair() -> (Arc<Session>, tokio::io::DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let session = Arc::new(Session::new(
            "127.0.0.1".to_string(),
            Box::new(server),
            Duration::from_secs(60),
        ));
        (session, client)
    }

    #[tokio::test]
    async fn concurrent_pushes_never_interleave_frames() {
        let (session, client) = session_pair();

        let mut tasks = Vec::new();
        for i in 0..50u64 {
            let s = session.clone();
            tasks.push(tokio::spawn(async move {
                s.push_job(json!([format!("0xheader{}", i), "0xseed", "0xtarget"]))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(session);

        let mut lines = BufReader::new(client).lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await.unwrap() {
            let parsed: serde_json::Value = serde_json::from_str(&line).expect("intact frame");
            assert_eq!(parsed["id"], 0);
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[tokio::test]
    async fn login_sticks_on_first_set() {
        let (session, _client) = session_pair();
        assert!(session.login().is_none());
        session.set_login("0xaaa0000000000000000000000000000000000001".to_string());
        session.set_login("0xbbb0000000000000000000000000000000000002".to_string());
        assert_eq!(
            session.login().as_deref(),
            Some("0xaaa0000000000000000000000000000000000001")
        );
    }

    #[tokio::test]
    async fn registry_removal_is_idempotent() {
        let registry = SessionRegistry::new();
        let (session, _client) = session_pair();
        registry.register(session.clone());
        assert!(registry.contains(session.id));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(session.id));
        assert!(!registry.remove(session.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (session, _client) = session_pair();
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn deadline_rolls_forward() {
        let (session, _client) = session_pair();
        let before = session.deadline();
        session.extend_deadline(Duration::from_secs(600));
        assert!(session.deadline() > before);
    }
}
