/// One miner connection
///
/// A reader loop that dispatches requests in arrival order and a writer task
/// that drains the connection's bounded send queue. Broadcasts reach the
/// writer through the registry without touching the reader.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stratum_core::is_valid_difficulty;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{ProtocolError, StratumCodec};
use super::protocol::{
    encode_line, methods, ShareSubmission, StratumError, StratumNotification, StratumRequest,
    StratumResponse,
};
use super::registry::{ConnectionHandle, OutboundMessage};
use super::server::StratumServer;
use crate::auth::parse_static_difficulty;
use crate::metrics::prometheus as metrics;
use crate::session::{ShareStats, WorkerContext};

/// Whether the reader loop keeps going after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Close,
}

pub struct WorkerConnection {
    server: Arc<StratumServer>,
    handle: ConnectionHandle,
    outbound: Option<mpsc::Receiver<OutboundMessage>>,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl WorkerConnection {
    pub fn new(server: Arc<StratumServer>, peer: SocketAddr, cancel: CancellationToken) -> Self {
        let config = server.config();
        let id = Uuid::new_v4().to_string();
        let context = Arc::new(Mutex::new(WorkerContext::new(
            id.clone(),
            peer,
            config.initial_difficulty,
            server.vardiff().is_some(),
        )));
        let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let handle = ConnectionHandle::new(id, peer, context, tx, cancel.clone());

        Self {
            server,
            handle,
            outbound: Some(rx),
            peer,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    fn context(&self) -> &Arc<Mutex<WorkerContext>> {
        &self.handle.context
    }

    /// Serve the connection until the peer leaves, a fatal error occurs or
    /// the connection is cancelled.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut framed = FramedRead::new(reader, StratumCodec::new(self.server.config().max_line_length));

        let Some(outbound) = self.outbound.take() else {
            return;
        };
        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            self.cancel.clone(),
            self.server.config().send_timeout(),
            self.peer,
        ));

        self.server.registry().register(self.handle.clone());
        tracing::debug!("📝 Connection registered: {} ({})", self.id(), self.peer);

        let vardiff_idle = self
            .server
            .vardiff()
            .map(|vd| Duration::from_secs_f64(vd.config().target_time));
        let idle_period = vardiff_idle.unwrap_or(Duration::from_secs(3600));
        let idle = time::sleep(idle_period);
        tokio::pin!(idle);

        let mut monitor = time::interval(Duration::from_secs(1));
        monitor.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                frame = framed.next() => match frame {
                    None => {
                        tracing::info!("📥 Connection closed by client: {}", self.peer);
                        break;
                    }
                    Some(Err(e)) => {
                        self.on_protocol_error(e);
                        break;
                    }
                    Some(Ok(request)) => {
                        let is_submit = request.method == methods::SUBMIT;
                        if self.handle_request(request).await == Next::Close {
                            break;
                        }
                        if is_submit {
                            idle.as_mut().reset(Instant::now() + idle_period);
                        }
                    }
                },

                () = &mut idle, if vardiff_idle.is_some() => {
                    self.on_vardiff_idle().await;
                    idle.as_mut().reset(Instant::now() + idle_period);
                }

                _ = monitor.tick() => {
                    if self.timed_out() {
                        break;
                    }
                }
            }
        }

        self.context().lock().disconnected = true;
        let remaining = self.server.registry().deregister(self.id());
        self.cancel.cancel();
        if let Err(e) = writer_task.await {
            tracing::debug!("writer task for {} failed: {}", self.peer, e);
        }

        tracing::info!("🔌 Connection closed: {} ({}), {} remaining", self.id(), self.peer, remaining);
    }

    fn on_protocol_error(&self, error: ProtocolError) {
        metrics::inc_protocol_errors();
        tracing::warn!("Protocol error from {}: {}", self.peer, error);

        let banning = self.server.banning();
        if error.is_junk() && banning.enabled {
            if let Err(e) = self.server.bans().ban(self.peer.ip(), banning.junk_ban_time()) {
                tracing::error!("Failed to ban {}: {}", self.peer, e);
            }
        }
    }

    /// Zombie (never spoke) and idle checks.
    fn timed_out(&self) -> bool {
        let config = self.server.config();
        let now = std::time::Instant::now();
        let ctx = self.context().lock();

        if ctx.is_zombie(now, config.zombie_timeout()) {
            tracing::info!("🧟 Dropping silent connection {}", self.peer);
            return true;
        }
        if ctx.is_idle(now, config.connection_timeout()) {
            tracing::warn!("⏱️  Connection timeout: {}", self.peer);
            return true;
        }
        false
    }

    async fn handle_request(&self, request: StratumRequest) -> Next {
        if self.server.bans().is_banned(&self.peer.ip()) {
            tracing::info!("🚫 Disconnecting banned peer {}", self.peer);
            return Next::Close;
        }

        self.context().lock().touch();
        tracing::debug!("📨 {} from {}", request.method, self.peer);

        let is_mining_call = matches!(
            request.method.as_str(),
            methods::SUBSCRIBE | methods::AUTHORIZE | methods::SUBMIT
        );
        if is_mining_call && !request.has_id() {
            if request.method == methods::SUBMIT {
                metrics::inc_rejected(StratumError::missing_id().code.label());
            }
            return self
                .respond(StratumResponse::error(Value::Null, StratumError::missing_id()))
                .await;
        }

        match request.method.as_str() {
            methods::SUBSCRIBE => self.handle_subscribe(&request).await,
            methods::AUTHORIZE => self.handle_authorize(&request).await,
            methods::SUBMIT => self.handle_submit(&request).await,
            methods::EXTRANONCE_SUBSCRIBE => {
                self.respond(StratumResponse::success(request.id.clone(), json!(true)))
                    .await
            }
            methods::SUGGEST_DIFFICULTY => self.handle_suggest_difficulty(&request).await,
            other => {
                tracing::debug!("Unsupported method {} from {}", other, self.peer);
                self.respond(StratumResponse::error(
                    request.id.clone(),
                    StratumError::unsupported_method(other),
                ))
                .await
            }
        }
    }

    async fn handle_subscribe(&self, request: &StratumRequest) -> Next {
        let extranonce1 = {
            let mut ctx = self.context().lock();
            ctx.extranonce1 = Some(self.server.extranonce().next().to_vec());
            if let Some(agent) = request.param_str(0).filter(|a| !a.is_empty()) {
                ctx.user_agent = Some(agent.to_string());
            }
            // Start the vardiff clock so the first share already yields an interval.
            if let Some(vd) = self.server.vardiff() {
                let now = ctx.clock(std::time::Instant::now());
                let difficulty = ctx.difficulty;
                if let Some(vardiff) = ctx.vardiff.as_mut().filter(|v| v.last_share_at().is_none()) {
                    vd.update(vardiff, difficulty, true, now);
                }
            }
            ctx.extranonce1.clone().unwrap_or_default()
        };

        tracing::info!("📡 Subscribe from {}", self.peer);

        let response = StratumResponse::success(
            request.id.clone(),
            json!([
                [
                    [methods::SET_DIFFICULTY, self.id()],
                    [methods::NOTIFY, self.id()]
                ],
                hex::encode(&extranonce1),
                self.server.jobs().extranonce2_size()
            ]),
        );
        if self.respond(response).await == Next::Close {
            return Next::Close;
        }

        let difficulty = self.context().lock().difficulty;
        if self.notify(StratumNotification::set_difficulty(difficulty)).await == Next::Close {
            return Next::Close;
        }

        // Marked subscribed and handed the current job under one lock, so a
        // broadcast racing with us is queued after this notify.
        let mut ctx = self.context().lock();
        ctx.subscribed = true;
        if let Some(job) = self.server.jobs().current_job() {
            match encode_line(&StratumNotification::notify(job.notify_params(true))) {
                Ok(line) => {
                    self.handle.try_send(Arc::new(line));
                }
                Err(e) => tracing::error!("failed to encode job {}: {}", job.id(), e),
            }
        }
        Next::Continue
    }

    async fn handle_authorize(&self, request: &StratumRequest) -> Next {
        let username = request.param_str(0).unwrap_or_default().trim();
        let password = request.param_str(1).unwrap_or_default();
        let timeout = self.server.config().authorize_timeout();

        let authorized = if username.is_empty() {
            false
        } else {
            match time::timeout(
                timeout,
                self.server.authorizer().authorize(self.peer.ip(), username, password),
            )
            .await
            {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    tracing::warn!("Authorization of {} failed: {:#}", username, e);
                    false
                }
                Err(_) => {
                    tracing::warn!("Authorization of {} timed out after {:?}", username, timeout);
                    false
                }
            }
        };

        if !authorized {
            self.context().lock().authorized = false;
            tracing::info!("🔐 Authorization denied for '{}' from {}", username, self.peer);
            return self
                .respond(StratumResponse::success(request.id.clone(), json!(false)))
                .await;
        }

        let static_difficulty = parse_static_difficulty(password);
        let (worker, new_difficulty) = {
            let mut ctx = self.context().lock();
            ctx.authorized = true;
            ctx.set_login(username);

            let new_difficulty = static_difficulty.filter(|d| {
                self.server
                    .vardiff()
                    .map_or(true, |vd| *d >= vd.config().min_diff)
            });
            if let Some(d) = new_difficulty {
                ctx.vardiff = None;
                ctx.set_difficulty(d);
            }
            (ctx.worker_id(), new_difficulty)
        };

        tracing::info!("🔐 Authorized {} from {}", worker, self.peer);
        if self
            .respond(StratumResponse::success(request.id.clone(), json!(true)))
            .await
            == Next::Close
        {
            return Next::Close;
        }

        if let Some(d) = new_difficulty {
            tracing::info!("Static difficulty {} for {}", d, worker);
            return self.notify(StratumNotification::set_difficulty(d)).await;
        }
        Next::Continue
    }

    async fn handle_submit(&self, request: &StratumRequest) -> Next {
        let share_context = {
            let ctx = self.context().lock();
            if !ctx.authorized {
                Err(StratumError::unauthorized_worker())
            } else if !ctx.subscribed {
                Err(StratumError::not_subscribed())
            } else {
                ctx.share_context().ok_or_else(StratumError::not_subscribed)
            }
        };

        let result = share_context.and_then(|share_ctx| {
            let submission = ShareSubmission::from_request(request)?;
            self.server.jobs().submit_share(&share_ctx, &submission)
        });

        match result {
            Ok(validated) => {
                if self
                    .respond(StratumResponse::success(request.id.clone(), json!(true)))
                    .await
                    == Next::Close
                {
                    return Next::Close;
                }

                let retarget = self.record_valid_share();
                if let Some(d) = retarget {
                    metrics::inc_vardiff_retarget();
                    tracing::debug!("🎚️  Retarget {} to {}", self.peer, d);
                    if self.notify(StratumNotification::set_difficulty(d)).await == Next::Close {
                        return Next::Close;
                    }
                }

                self.server
                    .shares()
                    .process(validated.share, validated.block)
                    .await;
            }
            Err(error) => {
                metrics::inc_rejected(error.code.label());
                tracing::debug!("Share from {} rejected: {}", self.peer, error.message);
                self.context().lock().record_share(false);

                if self
                    .respond(StratumResponse::error(request.id.clone(), error))
                    .await
                    == Next::Close
                {
                    return Next::Close;
                }
            }
        }

        self.check_share_ban()
    }

    /// Acknowledged unconditionally. Only a difficulty above the port's
    /// starting difficulty is applied.
    async fn handle_suggest_difficulty(&self, request: &StratumRequest) -> Next {
        if self
            .respond(StratumResponse::success(request.id.clone(), json!(true)))
            .await
            == Next::Close
        {
            return Next::Close;
        }

        let Some(requested) = request.param_f64(0).filter(|d| is_valid_difficulty(*d)) else {
            tracing::debug!("Unusable suggested difficulty from {}: {}", self.peer, request.params);
            return Next::Continue;
        };
        if requested <= self.server.config().initial_difficulty {
            return Next::Continue;
        }

        self.context().lock().set_difficulty(requested);
        tracing::info!("Difficulty set to {} as requested by {}", requested, self.peer);
        self.notify(StratumNotification::set_difficulty(requested)).await
    }

    /// Count a valid share and run vardiff on it.
    fn record_valid_share(&self) -> Option<f64> {
        let mut guard = self.context().lock();
        let ctx = &mut *guard;
        ctx.record_share(true);

        let vd = self.server.vardiff()?;
        let now = ctx.clock(std::time::Instant::now());
        let new_difficulty = vd.update(ctx.vardiff.as_mut()?, ctx.difficulty, false, now)?;
        ctx.set_difficulty(new_difficulty);
        Some(new_difficulty)
    }

    async fn on_vardiff_idle(&self) {
        let retarget = {
            let mut guard = self.context().lock();
            let ctx = &mut *guard;
            if !ctx.authorized {
                return;
            }
            let Some(vd) = self.server.vardiff() else {
                return;
            };
            let now = ctx.clock(std::time::Instant::now());
            let difficulty = ctx.difficulty;
            let new_difficulty = ctx
                .vardiff
                .as_mut()
                .and_then(|v| vd.update(v, difficulty, true, now));
            if let Some(d) = new_difficulty {
                ctx.set_difficulty(d);
            }
            new_difficulty
        };

        if let Some(d) = retarget {
            metrics::inc_vardiff_retarget();
            tracing::debug!("🎚️  Idle retarget {} to {}", self.peer, d);
            self.notify(StratumNotification::set_difficulty(d)).await;
        }
    }

    /// Ban and close when too many of the recent shares were invalid. The
    /// counters restart after every evaluation.
    fn check_share_ban(&self) -> Next {
        let banning = self.server.banning();
        if !banning.enabled {
            return Next::Continue;
        }

        let stats = {
            let mut ctx = self.context().lock();
            if ctx.stats.total() < banning.check_threshold {
                return Next::Continue;
            }
            std::mem::take(&mut ctx.stats)
        };

        if !should_ban(&stats, banning.invalid_percent) {
            return Next::Continue;
        }

        tracing::warn!(
            "🚫 {} sent {:.1}% invalid shares ({} of {})",
            self.peer,
            stats.invalid_percent(),
            stats.invalid_shares,
            stats.total()
        );
        if let Err(e) = self.server.bans().ban(self.peer.ip(), banning.ban_time()) {
            tracing::error!("Failed to ban {}: {}", self.peer, e);
        }
        Next::Close
    }

    async fn respond(&self, response: StratumResponse) -> Next {
        self.send_line(encode_line(&response)).await
    }

    async fn notify(&self, notification: StratumNotification) -> Next {
        self.send_line(encode_line(&notification)).await
    }

    async fn send_line(&self, line: Result<String, serde_json::Error>) -> Next {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode message for {}: {}", self.peer, e);
                return Next::Continue;
            }
        };

        if self
            .handle
            .send(Arc::new(line), self.server.config().send_timeout())
            .await
        {
            Next::Continue
        } else {
            Next::Close
        }
    }
}

fn should_ban(stats: &ShareStats, invalid_percent: f64) -> bool {
    stats.total() > 0 && stats.invalid_percent() >= invalid_percent
}

/// Drain the send queue into the socket. Messages already queued are written
/// before a cancellation is honoured.
async fn write_loop<W>(
    writer: W,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    cancel: CancellationToken,
    send_timeout: Duration,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, StratumCodec::default());

    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match time::timeout(send_timeout, sink.send(message.as_str())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Write to {} failed: {}", peer, e);
                break;
            }
            Err(_) => {
                tracing::warn!("⏱️  Write to {} timed out", peer);
                break;
            }
        }
    }

    cancel.cancel();
    if let Ok(Err(e)) = time::timeout(send_timeout, SinkExt::<&str>::close(&mut sink)).await {
        tracing::debug!("Closing writer for {} failed: {}", peer, e);
    }
}
