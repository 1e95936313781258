use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use stampede_config::RingConfig;
use stampede_proto::{Envelope, MAX_DATAGRAM, Process, ProcessStatus};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::DirectoryClient;
use crate::error::{Error, Result};
use crate::ring::membership::{MemberUpdate, MembershipState};
use crate::util::should_drop;

/// Observer invoked on every membership change. Implementations must be
/// cheap (push a signal, spawn a task); they run on the ring's tasks.
pub type MemberUpdateFn = Arc<dyn Fn(&Process, MemberUpdate) + Send + Sync>;

/// One node's view of the membership ring.
///
/// Owns the node's UDP socket and the membership state. The `run` loops
/// ping up to `max_successors` join-time successors every interval,
/// disseminate the full list epidemically, and recycle the expiration
/// pool; all datagram I/O carries read/write deadlines so no loop can
/// block indefinitely.
pub struct RingServer {
    socket: Arc<UdpSocket>,
    directory: DirectoryClient,
    config: RingConfig,
    state: Mutex<MembershipState>,
    callbacks: std::sync::RwLock<Vec<MemberUpdateFn>>,
}

impl std::fmt::Debug for RingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingServer")
            .field("config", &self.config)
            .field(
                "callback_count",
                &self.callbacks.read().map(|cbs| cbs.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl RingServer {
    pub fn new(
        socket: UdpSocket,
        self_process: Process,
        directory: DirectoryClient,
        config: RingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket: Arc::new(socket),
            directory,
            config,
            state: Mutex::new(MembershipState::new(self_process)),
            callbacks: std::sync::RwLock::new(Vec::new()),
        })
    }

    pub fn register_callback(&self, callback: MemberUpdateFn) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(callback);
        }
    }

    /// Spawn the datagram listener and the ping cron. Both stop when
    /// `shutdown` fires.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let listener = Arc::clone(self);
        let listener_shutdown = shutdown.clone();
        tokio::spawn(async move { listener.listen(listener_shutdown).await });

        let cron = Arc::clone(self);
        tokio::spawn(async move { cron.cron(shutdown).await });
    }

    // -- snapshots ---------------------------------------------------------

    pub async fn self_process(&self) -> Process {
        self.state.lock().await.self_process.clone()
    }

    pub async fn membership(&self) -> Vec<Process> {
        self.state.lock().await.members().to_vec()
    }

    pub async fn successors(&self) -> Vec<Process> {
        self.state
            .lock()
            .await
            .successors(self.config.max_successors)
    }

    pub async fn expiration_pool_empty(&self) -> bool {
        self.state.lock().await.expirations_empty()
    }

    /// Leader address: the earliest joiner once we are in a ring, the
    /// directory's answer before that.
    pub async fn lookup_leader(&self) -> Result<Option<String>> {
        {
            let state = self.state.lock().await;
            if let Some(leader) = state.leader() {
                return Ok(Some(leader.address()));
            }
        }
        self.directory.lookup().await
    }

    // -- lifecycle ---------------------------------------------------------

    /// Join the ring: bootstrap a solo ring when the directory knows no
    /// leader, otherwise ask the leader for a stamped join time.
    pub async fn join(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.contains_self() {
                info!(addr = %state.self_process.address(), "already in ring, join skipped");
                return Ok(());
            }
        }

        let leader = self.directory.lookup().await?;
        let Some(leader_addr) = leader else {
            // No leader: start a fresh ring with ourselves in it.
            let now = Utc::now();
            let stamped = {
                let mut state = self.state.lock().await;
                state.self_process.join_time = now;
                state.self_process.last_update_time = now;
                state.self_process.status = ProcessStatus::Alive;
                let stamped = state.self_process.clone();
                state.insert(stamped.clone());
                stamped
            };
            info!(addr = %stamped.address(), "no leader found, bootstrapping new ring");
            self.notify_member_update(&stamped, MemberUpdate::Insert)
                .await;
            return Ok(());
        };

        let request = {
            let state = self.state.lock().await;
            Envelope::Join {
                process: state.self_process.clone(),
            }
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&leader_addr).await?;
        self.send_with_deadline(&socket, &request).await?;

        let mut buffer = [0u8; MAX_DATAGRAM];
        let received = timeout(self.config.read_timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| Error::Deadline("join reply"))??;

        let Envelope::Join { process: stamped } = Envelope::decode(&buffer[..received])? else {
            return Err(Error::PeerStatus("join reply"));
        };

        {
            let mut state = self.state.lock().await;
            state.self_process = stamped.clone();
            state.insert(stamped.clone());
        }
        info!(addr = %stamped.address(), join_time = %stamped.join_time, "joined ring");

        // Newly joined nodes must never write the directory entry, so
        // notify observers without a leader-election tick.
        self.notify_observers(&stamped, MemberUpdate::Insert);
        Ok(())
    }

    /// Voluntary leave: stop participating and tell observers to
    /// evacuate (the serve layer clears its workers and jobs).
    pub async fn leave(&self) {
        let departed = {
            let mut state = self.state.lock().await;
            state.clear_for_leave();
            state.self_process.clone()
        };
        info!(addr = %departed.address(), "left ring");
        self.notify_observers(&departed, MemberUpdate::Leaved);
    }

    /// Write the directory entry iff we are the earliest joiner.
    pub async fn update_leader(&self) {
        let leader = {
            let state = self.state.lock().await;
            if !state.is_self_leader() {
                return;
            }
            state.self_process.clone()
        };

        if let Err(err) = self.directory.update(&leader).await {
            warn!(error = %err, "failed to update leader directory");
        }
    }

    // -- periodic work -----------------------------------------------------

    async fn cron(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            let (removed, successors) = {
                let mut state = self.state.lock().await;
                let removed = state.remove_expired(now);
                state.refresh_self(now);
                (removed, state.successors(self.config.max_successors))
            };

            for process in removed {
                info!(addr = %process.address(), "expired member removed");
                self.notify_member_update(&process, MemberUpdate::Delete)
                    .await;
            }

            for successor in successors {
                let server = Arc::clone(&self);
                tokio::spawn(async move {
                    debug!(addr = %successor.address(), "ping");
                    if let Err(err) = server.ping(&successor).await {
                        debug!(addr = %successor.address(), error = %err, "ping failed");
                        server.on_failure(&successor).await;
                    }
                });
            }
        }
    }

    /// One ping round trip over a fresh connected socket.
    async fn ping(&self, target: &Process) -> Result<()> {
        let payload = {
            let state = self.state.lock().await;
            Envelope::Ping {
                processes: state.members().to_vec(),
            }
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target.address()).await?;
        self.send_with_deadline(&socket, &payload).await?;

        let mut buffer = [0u8; MAX_DATAGRAM];
        let received = timeout(self.config.ping_timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| Error::Deadline("ping ack"))??;

        if !Envelope::decode(&buffer[..received])?.is_valid_ack() {
            return Err(Error::PeerStatus("ping ack"));
        }

        self.state.lock().await.on_ack(target, Utc::now());
        Ok(())
    }

    // -- datagram handling -------------------------------------------------

    async fn listen(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            let (received, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "udp receive failed");
                        continue;
                    }
                },
            };

            if self.state.lock().await.self_process.status == ProcessStatus::Leaved {
                continue;
            }

            let envelope = match Envelope::decode(&buffer[..received]) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(%remote, error = %err, "undecodable datagram");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match envelope {
                    Envelope::Ping { processes } => server.on_ping(remote, processes).await,
                    Envelope::Join { process } => server.on_join(remote, process).await,
                    Envelope::Leave { process } => server.on_leave(process).await,
                    Envelope::Ack { .. } => {}
                }
            });
        }
    }

    /// Merge the sender's view, then ack.
    async fn on_ping(&self, remote: SocketAddr, processes: Vec<Process>) {
        let inserted = {
            let mut state = self.state.lock().await;
            state.merge_remote(&processes, Utc::now(), self.config.expiration)
        };

        for process in inserted {
            info!(addr = %process.address(), "discovered member");
            self.notify_member_update(&process, MemberUpdate::Insert)
                .await;
        }

        if let Err(err) = self.send_to_with_deadline(&Envelope::ack(), remote).await {
            debug!(%remote, error = %err, "failed to ack ping");
        }
    }

    /// Leader side of a join: stamp the authoritative join time, reply,
    /// then insert and notify.
    async fn on_join(&self, remote: SocketAddr, mut process: Process) {
        {
            let state = self.state.lock().await;
            if state.find_index(&process).is_some() {
                warn!(addr = %process.address(), "join for a process already in the ring");
                return;
            }
        }

        let now = Utc::now();
        process.join_time = now;
        process.last_update_time = now;
        process.status = ProcessStatus::Alive;

        let reply = Envelope::Join {
            process: process.clone(),
        };
        if let Err(err) = self.send_to_with_deadline(&reply, remote).await {
            warn!(addr = %process.address(), error = %err, "failed to send join reply");
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.insert(process.clone());
        }
        info!(addr = %process.address(), "admitted member");
        self.notify_member_update(&process, MemberUpdate::Insert)
            .await;
    }

    /// A peer announced departure: mark it `Leaved` and let the
    /// expiration pool retire it.
    async fn on_leave(&self, process: Process) {
        let marked = {
            let mut state = self.state.lock().await;
            state.mark_peer_leave(&process, Utc::now(), self.config.expiration)
        };
        if marked {
            info!(addr = %process.address(), "peer announced leave");
        }
    }

    /// A ping failed: suspect the target, do not remove it yet.
    async fn on_failure(&self, process: &Process) {
        let marked = {
            let mut state = self.state.lock().await;
            state.mark_failure(process, Utc::now(), self.config.expiration)
        };
        if marked {
            info!(addr = %process.address(), "member suspected");
        }
    }

    // -- notification ------------------------------------------------------

    /// Insert/delete notification: leader-election tick plus observers.
    async fn notify_member_update(&self, process: &Process, action: MemberUpdate) {
        self.update_leader().await;
        self.notify_observers(process, action);
    }

    fn notify_observers(&self, process: &Process, action: MemberUpdate) {
        if let Ok(callbacks) = self.callbacks.read() {
            for callback in callbacks.iter() {
                callback(process, action);
            }
        }
    }

    // -- sends -------------------------------------------------------------

    async fn send_with_deadline(&self, socket: &UdpSocket, envelope: &Envelope) -> Result<()> {
        if should_drop(self.config.drop_probability) {
            return Err(Error::DatagramDropped);
        }
        let bytes = envelope.encode()?;
        timeout(self.config.write_timeout, socket.send(&bytes))
            .await
            .map_err(|_| Error::Deadline("udp send"))??;
        Ok(())
    }

    async fn send_to_with_deadline(&self, envelope: &Envelope, remote: SocketAddr) -> Result<()> {
        if should_drop(self.config.drop_probability) {
            return Err(Error::DatagramDropped);
        }
        let bytes = envelope.encode()?;
        timeout(self.config.write_timeout, self.socket.send_to(&bytes, remote))
            .await
            .map_err(|_| Error::Deadline("udp send"))??;
        Ok(())
    }
}
