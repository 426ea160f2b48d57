//! Stratum TCP front end.
//!
//! One task per accepted connection, bounded by the `max_conn` semaphore:
//! when every slot is taken the accept loop parks instead of shedding
//! connections. Frames are `\n`-terminated JSON objects of at most 1024
//! bytes; anything longer is treated as a flood and bans the source IP.
//! Template publications fan out to every registered session through a
//! bounded push pool.

use crate::config::Config;
use crate::health::HealthState;
use crate::metrics;
use crate::policy::PolicyEngine;
use crate::pow;
use crate::session::{Session, SessionRegistry};
use crate::shares::{SharePipeline, SubmitOrigin, Submission};
use crate::stratum::protocol::{ErrorReply, StratumRequest};
use crate::template::TemplateCache;
use crate::util;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{interval, timeout_at, Instant};

pub const MAX_REQ_SIZE: usize = 1024;
pub const MAX_CONCURRENT_SENDS: usize = 500;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
const ADAPTIVE_SESSION_THRESHOLD: usize = 1000;
const MIN_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline halves under heavy session counts, clamped to a floor so
/// loaded proxies do not time out healthy miners.
fn adaptive_timeout(base: Duration, sessions: usize) -> Duration {
    if sessions > ADAPTIVE_SESSION_THRESHOLD {
        (base / 2).max(MIN_READ_TIMEOUT)
    } else {
        base
    }
}

pub struct StratumServer {
    listen: String,
    base_timeout: Duration,
    max_conn: usize,
    diff_hex: String,
    registry: SessionRegistry,
    policy: Arc<PolicyEngine>,
    cache: Arc<TemplateCache>,
    pipeline: Arc<SharePipeline>,
    health: Arc<HealthState>,
    broadcast_slots: Arc<Semaphore>,
}

impl StratumServer {
    pub fn new(
        config: &Config,
        policy: Arc<PolicyEngine>,
        cache: Arc<TemplateCache>,
        pipeline: Arc<SharePipeline>,
        health: Arc<HealthState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listen: config.proxy.stratum.listen.clone(),
            base_timeout: Duration::from_secs(config.proxy.stratum.timeout_secs),
            max_conn: config.proxy.stratum.max_conn,
            diff_hex: pow::target_hex(config.proxy.difficulty),
            registry: SessionRegistry::new(),
            policy,
            cache,
            pipeline,
            health,
            broadcast_slots: Arc::new(Semaphore::new(MAX_CONCURRENT_SENDS)),
        })
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn read_timeout(&self) -> Duration {
        adaptive_timeout(self.base_timeout, self.registry.len())
    }

    fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .with_context(|| format!("invalid stratum listen address {}", self.listen))?;
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        TcpListener::from_std(socket.into()).context("failed to build stratum listener")
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        tracing::info!("✅ stratum listening on {}", self.listen);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tokio::spawn(self.clone().reap_idle_sessions());
        // subscribe before accepting so no publication can slip past
        let templates = self.cache.subscribe();
        tokio::spawn(self.clone().watch_templates(templates));

        let accept_slots = Arc::new(Semaphore::new(self.max_conn));
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("accept error: {}", e);
                    continue;
                }
            };
            let ip = peer.ip().to_string();
            Self::tune_socket(&stream);

            if self.policy.is_banned(&ip) || !self.policy.apply_limit_policy(&ip) {
                continue;
            }

            let Ok(permit) = accept_slots.clone().acquire_owned().await else {
                break Ok(());
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, ip).await;
                drop(permit);
            });
        }
    }

    fn tune_socket(stream: &TcpStream) {
        let _ = stream.set_nodelay(true);
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, ip: String) {
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Session::new(ip, Box::new(write_half), self.read_timeout()));
        self.registry.register(session.clone());
        metrics::inc_sessions();

        if let Err(e) = self.serve_session(read_half, &session).await {
            tracing::debug!(ip = %session.ip, "session ended: {}", e);
        }

        self.registry.remove(session.id);
        session.close();
        session.shutdown_writer().await;
        metrics::dec_sessions();
    }

    async fn serve_session(&self, read_half: OwnedReadHalf, session: &Arc<Session>) -> Result<()> {
        let mut reader = BufReader::new(read_half);
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_REQ_SIZE);

        loop {
            if session.is_closed() {
                return Ok(());
            }
            session.extend_deadline(self.read_timeout());
            buf.clear();

            loop {
                let deadline = session.deadline();
                let mut limited = (&mut reader).take((MAX_REQ_SIZE + 2) as u64);
                let read = limited.read_until(b'\n', &mut buf);
                tokio::select! {
                    res = timeout_at(deadline, read) => match res {
                        Ok(Ok(_)) => break,
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => {
                            // a successful push may have re-armed the deadline
                            if Instant::now() < session.deadline() {
                                continue;
                            }
                            tracing::debug!(ip = %session.ip, "read deadline expired");
                            return Ok(());
                        }
                    },
                    _ = session.closed_signal() => return Ok(()),
                }
            }

            let terminated = buf.last() == Some(&b'\n');
            let mut content: &[u8] = &buf;
            if terminated {
                content = &content[..content.len() - 1];
                if content.last() == Some(&b'\r') {
                    content = &content[..content.len() - 1];
                }
            }

            if content.len() > MAX_REQ_SIZE {
                tracing::warn!(ip = %session.ip, "socket flood detected");
                self.policy.ban_client(&session.ip);
                anyhow::bail!("oversize frame");
            }
            if !terminated {
                // EOF, possibly mid-line
                tracing::debug!(ip = %session.ip, "client disconnected");
                return Ok(());
            }

            session.touch();
            if content.len() <= 1 {
                continue;
            }

            let request: StratumRequest = match serde_json::from_slice(content) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(ip = %session.ip, "malformed stratum request: {}", e);
                    self.policy.apply_malformed_policy(&session.ip);
                    anyhow::bail!("malformed request");
                }
            };
            self.handle_message(session, request).await?;
        }
    }

    async fn handle_message(
        &self,
        session: &Arc<Session>,
        request: StratumRequest,
    ) -> io::Result<()> {
        let id = request.id.clone();
        match request.method.as_str() {
            "eth_submitLogin" => {
                let params = string_params(&request.params);
                match self.handle_login(session, &params, request.worker.as_deref()) {
                    Ok(()) => session.send_result(id, json!(true)).await,
                    Err(reply) => session.send_error(id, reply).await,
                }
            }
            "eth_getWork" => match self.work_reply() {
                Ok(work) => session.send_result(id, work).await,
                Err(reply) => session.send_error(id, reply).await,
            },
            "eth_submitWork" => {
                let params = string_params(&request.params);
                let submission = Submission {
                    origin: SubmitOrigin::Stratum,
                    subscribed: session.login().is_some() && self.registry.contains(session.id),
                    login: session.login().unwrap_or_default(),
                    worker: request.worker.unwrap_or_else(|| session.worker()),
                    ip: session.ip.clone(),
                };
                let (accepted, error) = self.pipeline.submit_work(&submission, &params).await;
                match error {
                    Some(reply) => session.send_error(id, reply).await,
                    None => session.send_result(id, json!(accepted)).await,
                }
            }
            "eth_submitHashrate" => session.send_result(id, json!(true)).await,
            "mining.ping" => {
                let params = string_params(&request.params);
                match params.first() {
                    Some(token) => {
                        session.mark_ping();
                        session.send_result(id, json!({ "pong": token })).await
                    }
                    None => session.send_error(id, ErrorReply::invalid_ping()).await,
                }
            }
            other => {
                tracing::debug!(ip = %session.ip, method = other, "unknown stratum method");
                self.policy.apply_malformed_policy(&session.ip);
                session.send_error(id, ErrorReply::method_not_found()).await
            }
        }
    }

    fn handle_login(
        &self,
        session: &Arc<Session>,
        params: &[String],
        worker: Option<&str>,
    ) -> std::result::Result<(), ErrorReply> {
        let Some(first) = params.first() else {
            return Err(ErrorReply::invalid_params());
        };
        let login = first.to_lowercase();
        if !util::is_valid_login(&login) {
            return Err(ErrorReply::invalid_login());
        }
        if !self.policy.apply_login_policy(&login, &session.ip) {
            return Err(ErrorReply::blacklisted());
        }
        session.set_login(login.clone());
        if let Some(worker) = worker {
            session.set_worker(util::sanitize_worker(worker));
        }
        tracing::info!("stratum miner connected {}@{}", login, session.ip);
        Ok(())
    }

    fn work_reply(&self) -> std::result::Result<Value, ErrorReply> {
        let template = self.cache.current().filter(|t| t.is_ready());
        match template {
            Some(t) if !self.health.is_sick() => Ok(json!([t.header, t.seed, self.diff_hex])),
            _ => Err(ErrorReply::work_not_ready()),
        }
    }

    async fn watch_templates(
        self: Arc<Self>,
        mut templates: tokio::sync::watch::Receiver<Option<Arc<crate::template::BlockTemplate>>>,
    ) {
        while templates.changed().await.is_ok() {
            self.clone().broadcast_jobs().await;
        }
    }

    /// Fans the current template out to every registered session, bounded
    /// by the push semaphore. Pushes to one session are serialised by its
    /// writer mutex, so a connected miner sees jobs in publication order.
    pub async fn broadcast_jobs(self: Arc<Self>) {
        let Some(template) = self.cache.current().filter(|t| t.is_ready()) else {
            return;
        };
        if self.health.is_sick() {
            return;
        }
        let payload = json!([template.header, template.seed, self.diff_hex]);
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return;
        }

        tracing::info!("broadcasting new job to {} stratum miners", sessions.len());
        metrics::inc_job_broadcasts();
        let started = Instant::now();

        let mut pushes = Vec::with_capacity(sessions.len());
        for session in sessions {
            let Ok(permit) = self.broadcast_slots.clone().acquire_owned().await else {
                break;
            };
            let server = self.clone();
            let payload = payload.clone();
            pushes.push(tokio::spawn(async move {
                let result = session.push_job(payload).await;
                drop(permit);
                match result {
                    Ok(()) => session.extend_deadline(server.read_timeout()),
                    Err(e) => {
                        tracing::warn!(ip = %session.ip, "job push failed: {}", e);
                        server.registry.remove(session.id);
                        session.close();
                    }
                }
            }));
        }
        for push in pushes {
            let _ = push.await;
        }
        tracing::debug!("job broadcast finished in {:?}", started.elapsed());
    }

    async fn reap_idle_sessions(self: Arc<Self>) {
        let mut ticker = interval(REAPER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = self.registry.reap_idle();
            if !reaped.is_empty() {
                tracing::info!("reaping {} idle stratum sessions", reaped.len());
            }
            for session in reaped {
                session.close();
            }
        }
    }
}

fn string_params(params: &Option<Value>) -> Vec<String> {
    params
        .as_ref()
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
