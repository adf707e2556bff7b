use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
};

use crate::porthole::{
    config, net, relay,
    tracker::{self, ConnTracker},
};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to create public listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read public listener address: {0}")]
    LocalAddr(#[source] io::Error),
    #[error("tunnel already started")]
    AlreadyStarted,
    #[error("tunnel stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Listening,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub local_port: u16,
    pub bind_addr: SocketAddr,
}

impl TunnelOptions {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl From<&config::Config> for TunnelOptions {
    fn from(cfg: &config::Config) -> Self {
        Self {
            bind_addr: cfg.bind_addr,
            ..Self::new(cfg.local_port)
        }
    }
}

/// What `start` bound and discovered.
#[derive(Debug, Clone)]
pub struct StartInfo {
    pub local_port: u16,
    pub public_addr: SocketAddr,
    pub host_ip: Option<Ipv4Addr>,
}

impl StartInfo {
    pub fn public_port(&self) -> u16 {
        self.public_addr.port()
    }

    pub fn public_endpoint(&self) -> String {
        match self.host_ip {
            Some(ip) => format!("{ip}:{}", self.public_port()),
            None => format!("unknown:{}", self.public_port()),
        }
    }
}

struct Inner {
    state: TunnelState,
    public_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

/// Exposes one local TCP port on an OS-assigned public port.
///
/// `start` binds and spawns the accept loop; `stop` closes the listener and
/// waits for every in-flight relay to finish on its own. Relays are never
/// cancelled, so a peer that keeps a connection open keeps `stop` waiting.
pub struct Tunnel {
    opts: TunnelOptions,
    tracker: Arc<ConnTracker>,
    shutdown: watch::Sender<bool>,
    // True whenever no public listener is open.
    listener_closed: watch::Sender<bool>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_port", &self.opts.local_port)
            .field("state", &self.state())
            .field("live_connections", &self.live_connections())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(opts: TunnelOptions) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        let (listener_closed, _rx) = watch::channel(true);
        Self {
            opts,
            tracker: Arc::new(ConnTracker::new()),
            shutdown,
            listener_closed,
            inner: Mutex::new(Inner {
                state: TunnelState::Idle,
                public_addr: None,
                accept_task: None,
            }),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.opts.local_port
    }

    pub fn public_port(&self) -> Option<u16> {
        self.lock().public_addr.map(|a| a.port())
    }

    pub fn state(&self) -> TunnelState {
        self.lock().state
    }

    pub fn live_connections(&self) -> usize {
        self.tracker.live()
    }

    #[cfg(test)]
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Binds the public listener and spawns the accept loop. Does not block on connections.
    pub async fn start(&self) -> Result<StartInfo, TunnelError> {
        self.check_startable()?;

        let ln = TcpListener::bind(self.opts.bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: self.opts.bind_addr,
                source,
            })?;
        let public_addr = ln.local_addr().map_err(TunnelError::LocalAddr)?;
        let host_ip = net::discover_host_ipv4();

        let mut inner = self.lock();
        // Another caller may have won the race while we were binding.
        match inner.state {
            TunnelState::Idle => {}
            TunnelState::Listening | TunnelState::Draining => {
                return Err(TunnelError::AlreadyStarted);
            }
            TunnelState::Stopped => return Err(TunnelError::Stopped),
        }

        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.opts.local_port));
        self.listener_closed.send_replace(false);
        let task = tokio::spawn(accept_loop(
            ln,
            local_addr,
            self.tracker.clone(),
            self.shutdown.subscribe(),
            self.listener_closed.clone(),
        ));

        inner.state = TunnelState::Listening;
        inner.public_addr = Some(public_addr);
        inner.accept_task = Some(task);

        tracing::info!(
            local_port = self.opts.local_port,
            public_addr = %public_addr,
            host_ip = ?host_ip,
            "tunnel: listening"
        );

        Ok(StartInfo {
            local_port: self.opts.local_port,
            public_addr,
            host_ip,
        })
    }

    /// Stops accepting and waits until every live relay has finished.
    ///
    /// Idempotent: once a stop has completed, further calls return immediately.
    pub async fn stop(&self) {
        let already_requested = self.shutdown.send_replace(true);

        let task = {
            let mut inner = self.lock();
            inner.state = match inner.state {
                TunnelState::Listening => TunnelState::Draining,
                TunnelState::Idle => TunnelState::Stopped,
                s => s,
            };
            inner.accept_task.take()
        };

        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(err = %err, "tunnel: accept loop ended abnormally");
                }
            }
            // The loop may have panicked before flagging the listener closed.
            self.listener_closed.send_replace(true);
        }

        // Concurrent callers that did not get the task handle still wait for the listener.
        let mut closed = self.listener_closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;

        if !already_requested {
            tracing::info!(live = self.tracker.live(), "tunnel: draining");
        }
        self.tracker.wait_idle().await;

        self.lock().state = TunnelState::Stopped;
    }

    fn check_startable(&self) -> Result<(), TunnelError> {
        match self.lock().state {
            TunnelState::Idle => Ok(()),
            TunnelState::Listening | TunnelState::Draining => {
                Err(TunnelError::AlreadyStarted)
            }
            TunnelState::Stopped => Err(TunnelError::Stopped),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn accept_loop(
    ln: TcpListener,
    local_addr: SocketAddr,
    tracker: Arc<ConnTracker>,
    mut shutdown: watch::Receiver<bool>,
    listener_closed: watch::Sender<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            biased;

            res = shutdown.changed() => {
                // Sender gone means the tunnel itself was dropped.
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                match res {
                    Ok((conn, peer)) => {
                        if *shutdown.borrow() {
                            tracing::debug!(
                                client = %peer,
                                "tunnel: dropping connection accepted during shutdown"
                            );
                            break;
                        }
                        let guard = tracker.track();
                        let conn_id = tracker::new_conn_id();
                        tracing::debug!(conn = %conn_id, client = %peer, "tunnel: accepted");
                        tokio::spawn(relay::handle(conn, local_addr, conn_id, guard));
                    }
                    Err(err) => {
                        if *shutdown.borrow() {
                            tracing::debug!(err = %err, "tunnel: accept interrupted by shutdown");
                            break;
                        }
                        tracing::warn!(err = %err, "tunnel: accept failed");
                        // Keeps fd exhaustion (EMFILE) from turning into a hot loop.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    drop(ln);
    listener_closed.send_replace(true);
    tracing::debug!("tunnel: listener closed");
}
