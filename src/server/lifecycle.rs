//! Health server lifecycle
//!
//! ```text
//! Idle ──start──▶ Serving ──signal──▶ ShuttingDown ──drained / deadline──▶ Stopped
//!   └──────────── build, bind or serve failure ─────────────────────────────▶┘
//! ```
//!
//! `Stopped` is terminal and entered exactly once, which is what resolves
//! every [`Completion`] handed out by the server.

use super::idle::IdleTimeoutAcceptor;
use super::shutdown::{shutdown_channel, ShutdownController, ShutdownSignal, Signals};
use crate::health::Aggregator;
use crate::logging::{self, Logger};
use axum::{http::StatusCode, Router};
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

/// Route of the aggregate health endpoint
pub const HEALTHZ_PATH: &str = "/healthz";

/// Route of the liveness probe
pub const LIVENESS_PATH: &str = "/liveness";

/// Time allowed to receive a request's headers
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed to handle a request and produce the response
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections without traffic for this long are closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for draining in-flight requests on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while building or running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no health configuration supplied")]
    MissingConfiguration,

    #[error("server has already been started")]
    AlreadyStarted,

    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] io::Error),

    #[error("could not register signal handlers: {0}")]
    Signal(#[source] io::Error),
}

/// Lifecycle of one [`HealthServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Serving,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::{Idle, Serving, ShuttingDown, Stopped};

        matches!(
            (self, next),
            (Idle, Serving)
                | (Serving, ShuttingDown)
                | (ShuttingDown, Stopped)
                | (Idle, Stopped)
                | (Serving, Stopped)
        )
    }
}

/// One-shot notification that the server has fully stopped
#[derive(Clone)]
pub struct Completion {
    receiver: watch::Receiver<LifecycleState>,
}

impl Completion {
    /// Wait until the server reaches `Stopped`
    pub async fn wait(&mut self) {
        // A dropped server can no longer be serving
        let _ = self
            .receiver
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await;
    }

    /// Check if the server has stopped (non-blocking)
    pub fn is_complete(&self) -> bool {
        *self.receiver.borrow() == LifecycleState::Stopped
    }
}

/// Everything needed to run the server, produced by [`HealthServer::build`]
pub struct ServerDescriptor {
    pub addr: String,
    pub router: Router,
    pub error_log: Arc<dyn Logger>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Serves `/healthz` and `/liveness` for one [`Aggregator`] and owns the
/// start and graceful shutdown of the underlying HTTP server
pub struct HealthServer {
    listen_addr: String,
    aggregator: Option<Arc<Aggregator>>,
    error_log: Arc<dyn Logger>,
    write_timeout: Duration,
    shutdown_timeout: Duration,
    state: Arc<watch::Sender<LifecycleState>>,
    shutdown: ShutdownController,
    shutdown_signal: ShutdownSignal,
    handle: Handle,
}

impl HealthServer {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        let (shutdown, shutdown_signal) = shutdown_channel();
        Self {
            listen_addr: listen_addr.into(),
            aggregator: None,
            error_log: logging::noop(),
            write_timeout: WRITE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            state: Arc::new(state),
            shutdown,
            shutdown_signal,
            handle: Handle::new(),
        }
    }

    pub fn aggregator(mut self, aggregator: Arc<Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Sink for connection-level errors
    pub fn error_log(mut self, error_log: Arc<dyn Logger>) -> Self {
        self.error_log = error_log;
        self
    }

    /// Override the request handling deadline (defaults to [`WRITE_TIMEOUT`])
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Override the drain deadline (defaults to [`SHUTDOWN_TIMEOUT`])
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Notification that resolves once the server has stopped
    pub fn completion(&self) -> Completion {
        Completion {
            receiver: self.state.subscribe(),
        }
    }

    /// Trigger graceful shutdown without an OS signal
    pub fn shutdown_controller(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Address the server is bound to, once it is listening
    ///
    /// Returns `None` if the server stops before it starts listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Build the router and server settings without opening a socket
    pub fn build(&self) -> Result<ServerDescriptor, ServerError> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or(ServerError::MissingConfiguration)?;

        let router = Router::new()
            .route(HEALTHZ_PATH, aggregator.health_handler())
            .route(LIVENESS_PATH, aggregator.liveness_handler())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.write_timeout,
            ));

        Ok(ServerDescriptor {
            addr: self.listen_addr.clone(),
            router,
            error_log: Arc::clone(&self.error_log),
            read_timeout: READ_TIMEOUT,
            write_timeout: self.write_timeout,
            idle_timeout: IDLE_TIMEOUT,
        })
    }

    /// Serve until graceful shutdown, then return the completion notification
    ///
    /// Graceful shutdown starts on SIGINT/SIGTERM or through
    /// [`HealthServer::shutdown_controller`]. On every error path the server
    /// moves to `Stopped`, so waiters on [`HealthServer::completion`] never hang.
    ///
    /// The SIGINT/SIGTERM handlers stay installed for the rest of the process,
    /// so after the server stops those signals no longer terminate it.
    pub async fn start(&self) -> Result<Completion, ServerError> {
        if self.state() != LifecycleState::Idle {
            return Err(ServerError::AlreadyStarted);
        }

        let descriptor = match self.build() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                transition(&self.state, LifecycleState::Stopped);
                return Err(e);
            }
        };
        let logger = self.lifecycle_log();

        if !transition(&self.state, LifecycleState::Serving) {
            return Err(ServerError::AlreadyStarted);
        }

        let signals = match Signals::register() {
            Ok(signals) => signals,
            Err(e) => {
                logger.fatal(&format!(
                    "[healthz-server] could not register signal handlers: {}",
                    e
                ));
                transition(&self.state, LifecycleState::Stopped);
                return Err(ServerError::Signal(e));
            }
        };

        let listener = match bind(&descriptor.addr) {
            Ok(listener) => listener,
            Err(source) => {
                logger.fatal(&format!(
                    "[healthz-server] could not listen on {}: {}",
                    descriptor.addr, source
                ));
                transition(&self.state, LifecycleState::Stopped);
                return Err(ServerError::Bind {
                    addr: descriptor.addr,
                    source,
                });
            }
        };

        let (drained_tx, drained_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_for_shutdown(ShutdownWatch {
            signals,
            trigger: self.shutdown_signal.clone(),
            handle: self.handle.clone(),
            state: Arc::clone(&self.state),
            logger: Arc::clone(&logger),
            drained: drained_rx,
            deadline: self.shutdown_timeout,
        }));

        let mut server = axum_server::from_tcp(listener)
            .acceptor(IdleTimeoutAcceptor::new(
                descriptor.idle_timeout,
                Arc::clone(&descriptor.error_log),
            ))
            .handle(self.handle.clone());
        server
            .http_builder()
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(descriptor.read_timeout);

        logger.info(&format!("[healthz-server] listening on {}", descriptor.addr));
        let result = server
            .serve(descriptor.router.into_make_service())
            .await;
        // The watcher may already be gone if it hit the deadline
        let _ = drained_tx.send(());

        match result {
            Ok(()) => Ok(self.completion()),
            Err(e) => {
                logger.fatal(&format!(
                    "[healthz-server] could not serve on {}: {}",
                    descriptor.addr, e
                ));
                watcher.abort();
                transition(&self.state, LifecycleState::Stopped);
                Err(ServerError::Serve(e))
            }
        }
    }

    fn lifecycle_log(&self) -> Arc<dyn Logger> {
        self.aggregator
            .as_ref()
            .map(|aggregator| aggregator.log())
            .unwrap_or_else(logging::noop)
    }
}

/// Move to `next` if the current state allows it
///
/// Returns false, leaving the state untouched, for a refused transition. In
/// particular nothing leaves `Stopped`, so completion fires once.
fn transition(state: &watch::Sender<LifecycleState>, next: LifecycleState) -> bool {
    let mut from = LifecycleState::Idle;
    let changed = state.send_if_modified(|current| {
        from = *current;
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    });
    if !changed && from != next {
        warn!(from = ?from, to = ?next, "Refused lifecycle transition");
    }
    changed
}

fn bind(addr: &str) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

struct ShutdownWatch {
    signals: Signals,
    trigger: ShutdownSignal,
    handle: Handle,
    state: Arc<watch::Sender<LifecycleState>>,
    logger: Arc<dyn Logger>,
    drained: oneshot::Receiver<()>,
    deadline: Duration,
}

/// Wait for a shutdown trigger, then drain in-flight requests
///
/// hyper stops keep-alive on every connection once graceful shutdown starts,
/// so each connection closes after its current request.
async fn watch_for_shutdown(watch: ShutdownWatch) {
    let ShutdownWatch {
        mut signals,
        mut trigger,
        handle,
        state,
        logger,
        drained,
        deadline,
    } = watch;

    tokio::select! {
        signal = signals.recv() => {
            info!(signal = signal, "Initiating graceful shutdown");
        }
        _ = trigger.wait() => {
            info!("Initiating graceful shutdown on request");
        }
    }

    transition(&state, LifecycleState::ShuttingDown);
    logger.info("[healthz-server] shutting down...");
    handle.graceful_shutdown(None);

    if tokio::time::timeout(deadline, drained).await.is_err() {
        logger.fatal(&format!(
            "[healthz-server] could not gracefully shut down the server within {:?}",
            deadline
        ));
        handle.shutdown();
    }

    logger.info("[healthz-server] shut down");
    transition(&state, LifecycleState::Stopped);
}
