//! Dependency checks polled by the aggregator
//!
//! A [`Check`] is anything that can answer "are you healthy right now?".
//! The aggregator never looks past this trait, so a check can be a network
//! probe, a database ping or a flag flipped by another component.

use anyhow::{anyhow, Context};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A single dependency probe
///
/// `evaluate` is called synchronously once per `/healthz` request and must
/// return quickly: a slow check delays the whole response.
pub trait Check: Send + Sync {
    fn evaluate(&self) -> anyhow::Result<()>;
}

impl<F> Check for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn evaluate(&self) -> anyhow::Result<()> {
        self()
    }
}

/// A named entry in the check registry
///
/// Names are not required to be unique; duplicates are reported twice.
#[derive(Clone)]
pub struct Provider {
    name: String,
    check: Arc<dyn Check>,
}

impl Provider {
    pub fn new(name: impl Into<String>, check: impl Check + 'static) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Build a provider from a closure
    pub fn from_fn<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, check)
    }

    /// Build a provider around a check that is already shared elsewhere
    pub fn shared(name: impl Into<String>, check: Arc<dyn Check>) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self) -> anyhow::Result<()> {
        self.check.evaluate()
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name).finish()
    }
}

/// In-memory health flag
///
/// Clones share the same flag, so one handle can be registered with the
/// aggregator while another is kept by the component that owns the state.
#[derive(Debug, Clone)]
pub struct FlagCheck {
    healthy: Arc<AtomicBool>,
    reason: Arc<RwLock<String>>,
}

impl FlagCheck {
    /// Create a new flag (initially healthy)
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            reason: Arc::new(RwLock::new(String::from("unhealthy"))),
        }
    }

    pub fn set_healthy(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    /// Mark the flag unhealthy; `reason` becomes the reported message
    pub fn set_unhealthy(&self, reason: impl Into<String>) {
        if let Ok(mut current) = self.reason.write() {
            *current = reason.into();
        }
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl Default for FlagCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl Check for FlagCheck {
    fn evaluate(&self) -> anyhow::Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let reason = self
            .reason
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|_| String::from("unhealthy"));
        Err(anyhow!(reason))
    }
}

/// Probe that a TCP endpoint accepts connections
///
/// The connect is blocking and bounded by `timeout`; keep it short.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    target: String,
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .target
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", self.target))?
            .collect();
        if addrs.is_empty() {
            return Err(anyhow!("{} resolved to no addresses", self.target));
        }
        Ok(addrs)
    }
}

impl Check for TcpCheck {
    fn evaluate(&self) -> anyhow::Result<()> {
        let mut last_error = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e).with_context(|| format!("connecting to {}", self.target)),
            None => Err(anyhow!("{} resolved to no addresses", self.target)),
        }
    }
}
