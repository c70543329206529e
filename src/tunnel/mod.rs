//! Local port-forward tunnels to in-cluster services.
//!
//! A [`TunnelSession`] owns a supervisor task that binds a local listener,
//! dials the target through a [`Dialer`] and relays every accepted local
//! connection over its own stream. Any bind, dial or relay failure moves the
//! session to `Disconnected` and the supervisor reconnects with backoff until
//! the session is stopped or its cancellation token fires. State transitions
//! are published on a `watch` channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::params::Parameters;
use crate::retry::{Backoff, RetryConfig};
use crate::{Error, Result, RELAY_NAME, UI_NAME};

/// Service port of the relay
pub const RELAY_SERVICE_PORT: u16 = 80;

/// Service port of the UI
pub const UI_SERVICE_PORT: u16 = 80;

/// Bidirectional byte stream to the cluster side of a tunnel
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Boxed cluster-side stream
pub type TunnelStream = Box<dyn TunnelIo>;

/// An in-cluster service port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub service: String,
    /// Service port
    pub port: u16,
}

impl TunnelTarget {
    /// The relay service
    pub fn relay(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: RELAY_NAME.to_string(),
            port: RELAY_SERVICE_PORT,
        }
    }

    /// The UI service
    pub fn ui(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: UI_NAME.to_string(),
            port: UI_SERVICE_PORT,
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc/{}:{} in {}", self.service, self.port, self.namespace)
    }
}

/// Lifecycle of a tunnel session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Binding the listener or dialing the target
    Connecting,
    /// Listener bound and target reachable
    Connected,
    /// Last attempt failed; a reconnect is scheduled
    Disconnected(String),
    /// Session stopped
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected(reason) => write!(f, "disconnected: {}", reason),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Opens streams to a target through the cluster API
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a new stream to `target`
    async fn dial(&self, target: &TunnelTarget) -> Result<TunnelStream>;
}

/// Launches the local browser
#[cfg_attr(test, automock)]
pub trait BrowserLauncher: Send + Sync {
    /// Open `url`
    fn open(&self, url: &str) -> Result<()>;
}

/// The desktop's default browser
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        webbrowser::open(url)?;
        Ok(())
    }
}

/// Tunnel tuning
#[derive(Clone, Debug, Default)]
pub struct TunnelConfig {
    /// Reconnect backoff
    pub backoff: RetryConfig,
}

/// Starts supervised tunnels
pub struct TunnelManager {
    dialer: Arc<dyn Dialer>,
    config: TunnelConfig,
}

impl TunnelManager {
    /// Manager dialing through `dialer`
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            config: TunnelConfig::default(),
        }
    }

    /// Override tuning
    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a tunnel from `127.0.0.1:local_port` to `target`.
    ///
    /// Returns once the session first reaches `Connected`. Failures before
    /// that are retried; if `cancel` fires first the session is torn down and
    /// a tunnel error carrying the last failure is returned.
    pub async fn start(
        &self,
        local_port: u16,
        target: TunnelTarget,
        cancel: CancellationToken,
    ) -> Result<TunnelSession> {
        let (state_tx, mut state_rx) = watch::channel(TunnelState::Connecting);
        let token = cancel.child_token();

        let supervisor = Supervisor {
            dialer: self.dialer.clone(),
            backoff: Backoff::new(self.config.backoff.clone()),
            target: target.clone(),
            local_port,
            state: state_tx,
            cancel: token.clone(),
        };
        info!(tunnel = %target, local_port = local_port, "Starting tunnel");
        let handle = tokio::spawn(supervisor.run());

        let session = TunnelSession {
            local_port,
            target,
            state: state_rx.clone(),
            cancel: token,
            handle: Some(handle),
        };

        let mut last_failure = None;
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                TunnelState::Connected => return Ok(session),
                TunnelState::Disconnected(reason) => last_failure = Some(reason),
                TunnelState::Closed => break,
                TunnelState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }

        let target = session.target.to_string();
        session.stop().await;
        Err(Error::tunnel(match last_failure {
            Some(reason) => format!("tunnel to {} stopped before connecting: {}", target, reason),
            None => format!("tunnel to {} stopped before connecting", target),
        }))
    }

    /// Start the relay tunnel on `params.relay_port`
    pub async fn start_relay(
        &self,
        params: &Parameters,
        cancel: CancellationToken,
    ) -> Result<TunnelSession> {
        self.start(params.relay_port, TunnelTarget::relay(&params.namespace), cancel)
            .await
    }

    /// Start the UI tunnel on `params.ui_port`. Once it is connected the
    /// browser is opened if `params.open_browser` is set.
    pub async fn start_ui(
        &self,
        params: &Parameters,
        browser: &dyn BrowserLauncher,
        cancel: CancellationToken,
    ) -> Result<TunnelSession> {
        let session = self
            .start(params.ui_port, TunnelTarget::ui(&params.namespace), cancel)
            .await?;
        if params.open_browser {
            let url = session.url();
            if let Err(e) = browser.open(&url) {
                warn!(url = %url, error = %e, "Failed to open browser");
            }
        }
        Ok(session)
    }
}

/// A running tunnel. Dropping the session cancels its supervisor.
pub struct TunnelSession {
    local_port: u16,
    target: TunnelTarget,
    state: watch::Receiver<TunnelState>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TunnelSession {
    /// Local port
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local URL
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Target service
    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Subscribe to state transitions
    pub fn watch(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Stop the supervisor and release the listener
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Tunnel supervisor ended abnormally");
            }
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    dialer: Arc<dyn Dialer>,
    backoff: Backoff,
    target: TunnelTarget,
    local_port: u16,
    state: watch::Sender<TunnelState>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Publish `state` if it differs from the current one
    fn set(&self, state: TunnelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if !changed {
            return;
        }
        match &state {
            TunnelState::Disconnected(reason) => {
                warn!(tunnel = %self.target, reason = %reason, "Tunnel disconnected")
            }
            other => debug!(tunnel = %self.target, state = %other, "Tunnel state changed"),
        }
    }

    async fn run(mut self) {
        let mut listener: Option<TcpListener> = None;
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<String>();

        loop {
            self.set(TunnelState::Connecting);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.establish(&mut listener) => attempt,
            };

            let failure = match attempt {
                Err(e) => e.to_string(),
                Ok(first) => {
                    let Some(bound) = listener.as_ref() else {
                        continue;
                    };
                    self.backoff.reset();
                    self.set(TunnelState::Connected);
                    info!(tunnel = %self.target, local_port = self.local_port, "Tunnel connected");

                    while fail_rx.try_recv().is_ok() {}
                    match self.serve(bound, first, &fail_tx, &mut fail_rx).await {
                        Some(reason) => reason,
                        None => break,
                    }
                }
            };

            self.set(TunnelState::Disconnected(failure));
            let delay = self.backoff.next_delay();
            debug!(tunnel = %self.target, delay_ms = delay.as_millis(), "Reconnecting after backoff");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(listener);
        self.set(TunnelState::Closed);
        info!(tunnel = %self.target, "Tunnel closed");
    }

    /// Bind the listener if needed, then prove the target is reachable
    async fn establish(&self, listener: &mut Option<TcpListener>) -> Result<TunnelStream> {
        if listener.is_none() {
            let bound = TcpListener::bind(("127.0.0.1", self.local_port))
                .await
                .map_err(|e| {
                    Error::tunnel(format!(
                        "failed to listen on 127.0.0.1:{}: {}",
                        self.local_port, e
                    ))
                })?;
            *listener = Some(bound);
        }
        self.dialer.dial(&self.target).await
    }

    /// Relay accepted connections until one fails (returns its reason) or the
    /// session is cancelled (returns `None`).
    async fn serve(
        &self,
        listener: &TcpListener,
        first: TunnelStream,
        fail_tx: &mpsc::UnboundedSender<String>,
        fail_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Option<String> {
        let mut ready = Some(first);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                Some(reason) = fail_rx.recv() => return Some(reason),
                accepted = listener.accept() => {
                    let (local, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => return Some(format!("accept failed: {}", e)),
                    };
                    let remote = match ready.take() {
                        Some(stream) => stream,
                        None => match self.dialer.dial(&self.target).await {
                            Ok(stream) => stream,
                            Err(e) => return Some(e.to_string()),
                        },
                    };
                    self.relay(local, peer, remote, fail_tx.clone());
                }
            }
        }
    }

    fn relay(
        &self,
        mut local: TcpStream,
        peer: SocketAddr,
        mut remote: TunnelStream,
        fail_tx: mpsc::UnboundedSender<String>,
    ) {
        let cancel = self.cancel.clone();
        debug!(peer = %peer, tunnel = %self.target, "Relaying connection");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => match copied {
                    Ok((sent, received)) => {
                        debug!(peer = %peer, sent = sent, received = received, "Connection closed");
                    }
                    Err(e) => {
                        let _ = fail_tx.send(format!("connection from {} failed: {}", peer, e));
                    }
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dialer whose streams are in-memory echo servers; fails the first
    /// `failures` dials.
    struct EchoDialer {
        failures: u32,
        delay: Duration,
        dials: AtomicU32,
    }

    impl EchoDialer {
        fn new(failures: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failures,
                delay,
                dials: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self, target: &TunnelTarget) -> Result<TunnelStream> {
            tokio::time::sleep(self.delay).await;
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::tunnel(format!("service {} unreachable", target.service)));
            }
            let (client, mut server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = server.read(&mut buf).await {
                    if n == 0 || server.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(client))
        }
    }

    fn fast_config() -> TunnelConfig {
        TunnelConfig {
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(400),
                backoff_multiplier: 2.0,
            },
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn story_tunnel_relays_traffic_and_releases_port_on_stop() {
        let dialer = EchoDialer::new(0, Duration::ZERO);
        let manager = TunnelManager::new(dialer.clone()).with_config(fast_config());
        let port = free_port();

        let session = manager
            .start(port, TunnelTarget::relay("kube-system"), CancellationToken::new())
            .await
            .expect("tunnel should connect");
        assert_eq!(session.state(), TunnelState::Connected);
        assert_eq!(session.url(), format!("http://localhost:{}", port));

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let mut watch = session.watch();
        session.stop().await;
        assert_eq!(*watch.borrow_and_update(), TunnelState::Closed);

        // The listener is released
        TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("port should be free after stop");
    }

    #[tokio::test]
    async fn story_unreachable_target_is_retried_not_fatal() {
        let dialer = EchoDialer::new(2, Duration::from_millis(100));
        let manager = TunnelManager::new(dialer.clone()).with_config(fast_config());
        let port = free_port();
        let cancel = CancellationToken::new();

        let session = manager
            .start(port, TunnelTarget::relay("kube-system"), cancel)
            .await
            .expect("tunnel should connect after retries");

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
        assert_eq!(session.state(), TunnelState::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn state_transitions_are_published() {
        let dialer = EchoDialer::new(u32::MAX, Duration::from_millis(100));
        let (state_tx, mut rx) = watch::channel(TunnelState::Connecting);
        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            dialer,
            backoff: Backoff::new(fast_config().backoff),
            target: TunnelTarget::relay("kube-system"),
            local_port: free_port(),
            state: state_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        let mut seen = vec![rx.borrow_and_update().clone()];
        while seen.len() < 3 {
            rx.changed().await.unwrap();
            seen.push(rx.borrow_and_update().clone());
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(seen[0], TunnelState::Connecting);
        assert!(matches!(&seen[1], TunnelState::Disconnected(r) if r.contains("unreachable")));
        assert_eq!(seen[2], TunnelState::Connecting);
        assert_eq!(*rx.borrow(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn cancellation_before_connect_is_a_tunnel_error() {
        let dialer = EchoDialer::new(u32::MAX, Duration::from_millis(10));
        let manager = TunnelManager::new(dialer).with_config(fast_config());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = match manager
            .start(free_port(), TunnelTarget::relay("kube-system"), cancel)
            .await
        {
            Ok(_) => panic!("tunnel should not connect"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Tunnel(_)));
        assert!(err.to_string().contains("unreachable"));
    }

    fn tunnel_params(relay_port: u16, ui_port: u16, open_browser: bool) -> Parameters {
        Parameters {
            namespace: "cilium".into(),
            relay_port,
            ui_port,
            open_browser,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn relay_tunnel_uses_parameter_port_and_namespace() {
        let dialer = EchoDialer::new(0, Duration::ZERO);
        let manager = TunnelManager::new(dialer).with_config(fast_config());
        let port = free_port();

        let session = manager
            .start_relay(&tunnel_params(port, 0, false), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.local_port(), port);
        assert_eq!(session.target(), &TunnelTarget::relay("cilium"));
        session.stop().await;
    }

    #[tokio::test]
    async fn ui_tunnel_opens_browser_once_connected() {
        let dialer = EchoDialer::new(0, Duration::ZERO);
        let manager = TunnelManager::new(dialer).with_config(fast_config());
        let port = free_port();

        let mut browser = MockBrowserLauncher::new();
        let expected = format!("http://localhost:{}", port);
        browser
            .expect_open()
            .withf(move |url| url == expected)
            .times(1)
            .returning(|_| Ok(()));

        let session = manager
            .start_ui(&tunnel_params(0, port, true), &browser, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.target().service, UI_NAME);
        assert_eq!(session.target().namespace, "cilium");
        session.stop().await;
    }

    #[tokio::test]
    async fn browser_stays_closed_when_disabled() {
        let dialer = EchoDialer::new(0, Duration::ZERO);
        let manager = TunnelManager::new(dialer).with_config(fast_config());

        let mut browser = MockBrowserLauncher::new();
        browser.expect_open().never();

        let session = manager
            .start_ui(&tunnel_params(0, free_port(), false), &browser, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(session.state(), TunnelState::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn browser_failure_is_not_fatal() {
        let dialer = EchoDialer::new(0, Duration::ZERO);
        let manager = TunnelManager::new(dialer).with_config(fast_config());

        let mut browser = MockBrowserLauncher::new();
        browser.expect_open().returning(|_| {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no browser",
            )))
        });

        let session = manager
            .start_ui(&tunnel_params(0, free_port(), true), &browser, CancellationToken::new())
            .await
            .expect("browser errors should not fail the tunnel");
        session.stop().await;
    }
}
