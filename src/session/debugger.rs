//! Debugger session over one target connection
//!
//! Owns the connection and the registry behind a single lock. Breakpoint
//! operations take a script buffer and fan out to every thread running it;
//! replies are applied when the front-end calls [`Debugger::update`].

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::registry::{Applied, Breakpoint, Registry, VmValue};
use crate::common::{config::Config, Error, Result};
use crate::proto::{Command, Connection, ConnectionOptions, ThreadId, ThreadMap};

/// Debug session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connect in progress
    Connecting,
    /// Waiting for the first thread list
    AwaitingInitialSync,
    /// Thread list known, commands accepted
    Ready,
    /// Connection gone, terminal
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::AwaitingInitialSync => write!(f, "awaiting initial sync"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Options for establishing a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection: ConnectionOptions,
    /// How long to wait for the target's first thread list
    pub initial_sync_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            initial_sync_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            connection: ConnectionOptions::from(config),
            initial_sync_timeout: Duration::from_secs(config.timeouts.initial_sync_secs),
        }
    }
}

struct Inner {
    state: SessionState,
    conn: Option<Connection>,
    registry: Registry,
    /// Set once any thread list has been applied
    threads_received: bool,
    last_error: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            conn: None,
            registry: Registry::new(),
            threads_received: false,
            last_error: None,
        }
    }

    fn ensure_ready(&self, action: &str) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(Error::SessionClosed),
            state => Err(Error::invalid_state(action, &state.to_string())),
        }
    }

    /// Close the session if `err` is fatal, then hand it back
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            tracing::error!(error = %err, state = %self.state, "Closing debug session");
            self.state = SessionState::Closed;
            self.conn = None;
            self.registry.reset();
            self.last_error = Some(err.to_string());
        }
        err
    }

    async fn send(&mut self, cmd: Command) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::SessionClosed);
        };
        let result = conn.send_command(&cmd).await;
        result.map_err(|e| self.fail(e))
    }

    /// Send `make(tid)` to every thread running `script_buffer`
    async fn fan_out(&mut self, script_buffer: &str, make: impl Fn(ThreadId) -> Command) -> Result<usize> {
        let tids = self.registry.threads_running(script_buffer)?.to_vec();
        for &tid in &tids {
            self.send(make(tid)).await?;
        }
        Ok(tids.len())
    }

    /// Apply every reply available right now
    fn drain_replies(&mut self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Err(Error::SessionClosed);
            };
            match conn.poll_reply() {
                Ok(Some(reply)) => {
                    if self.registry.apply(reply) == Applied::ThreadsUpdated {
                        self.threads_received = true;
                    }
                    processed += 1;
                }
                Ok(None) => return Ok(processed),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    async fn wait_for_threads(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_replies()?;
            if self.threads_received {
                return Ok(());
            }

            let Some(conn) = self.conn.as_ref() else {
                return Err(Error::SessionClosed);
            };
            let ready = tokio::time::timeout_at(deadline, conn.readable()).await;
            match ready {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(self.fail(e)),
                Err(_) => return Err(self.fail(Error::InitializationTimeout(timeout.as_millis() as u64))),
            }
        }
    }
}

/// A debug session attached to one script VM target.
///
/// All operations are serialized; share it as `Arc<Debugger>`.
pub struct Debugger {
    addr: String,
    inner: Mutex<Inner>,
}

impl Debugger {
    /// Connect to a target and wait for its initial thread list.
    ///
    /// Returns a session in [`SessionState::Ready`], or the error that closed it.
    pub async fn connect(host: &str, port: u16, options: &SessionOptions) -> Result<Self> {
        let debugger = Self {
            addr: format!("{}:{}", host, port),
            inner: Mutex::new(Inner::new()),
        };
        debugger.establish(options).await?;
        Ok(debugger)
    }

    async fn establish(&self, options: &SessionOptions) -> Result<()> {
        let mut inner = self.inner.lock().await;
        tracing::info!(addr = %self.addr, "Connecting to target");

        let conn = match Connection::connect(&self.addr, &options.connection).await {
            Ok(conn) => conn,
            Err(e) => return Err(inner.fail(e)),
        };
        inner.conn = Some(conn);

        inner.send(Command::GetThreads).await?;
        inner.state = SessionState::AwaitingInitialSync;

        inner.wait_for_threads(options.initial_sync_timeout).await?;
        inner.state = SessionState::Ready;
        tracing::info!(
            addr = %self.addr,
            script_buffers = inner.registry.threads().len(),
            "Debug session ready"
        );
        Ok(())
    }

    /// Target address as `host:port`
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Arm a breakpoint on every thread running `script_buffer`
    pub async fn set_breakpoint(&self, script_buffer: &str, address: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("set breakpoint")?;

        let sent = inner
            .fan_out(script_buffer, |tid| Command::SetBreakpoint { tid, addr: address })
            .await?;

        // Registered only once some thread was actually told about it
        if sent == 0 {
            tracing::warn!(script_buffer, addr = address, "No threads run this script buffer, breakpoint not set");
            return Ok(());
        }

        let bp = Breakpoint::new(script_buffer, address);
        if inner.registry.insert(bp) {
            tracing::info!(script_buffer, addr = address, threads = sent, "Breakpoint set");
        } else {
            tracing::debug!(script_buffer, addr = address, threads = sent, "Breakpoint re-armed");
        }
        Ok(())
    }

    /// Disarm a breakpoint. Unknown breakpoints are ignored.
    pub async fn unset_breakpoint(&self, script_buffer: &str, address: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("unset breakpoint")?;

        let bp = Breakpoint::new(script_buffer, address);
        if !inner.registry.contains(&bp) {
            tracing::debug!(%bp, "Breakpoint not set, nothing to remove");
            return Ok(());
        }

        let sent = inner
            .fan_out(script_buffer, |tid| Command::UnsetBreakpoint { tid, addr: address })
            .await?;
        inner.registry.remove(&bp);
        tracing::info!(%bp, threads = sent, "Breakpoint removed");
        Ok(())
    }

    /// Apply every reply the target has sent so far.
    ///
    /// Never waits on the network. Returns the number of replies processed.
    pub async fn update(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("update")?;
        inner.drain_replies()
    }

    /// Hand every queued hit to `handler`, oldest first.
    ///
    /// The handler runs without the session lock held.
    pub async fn drain_hits<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&Breakpoint),
    {
        let hits = self.inner.lock().await.registry.take_hits();
        for bp in &hits {
            handler(bp);
        }
        hits.len()
    }

    /// Hand every queued inspection value to `handler`, oldest first
    pub async fn drain_values<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&VmValue),
    {
        let values = self.inner.lock().await.registry.take_values();
        for value in &values {
            handler(value);
        }
        values.len()
    }

    /// Resume every thread running the breakpoint's script buffer
    pub async fn continue_execution(&self, bp: &Breakpoint) -> Result<()> {
        self.resume(&bp.script_buffer).await
    }

    /// Resume every thread running `script_buffer`
    pub async fn resume(&self, script_buffer: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("continue")?;
        let sent = inner.fan_out(script_buffer, |tid| Command::Continue { tid }).await?;
        tracing::debug!(script_buffer, threads = sent, "Continued");
        Ok(())
    }

    /// Stop every thread running `script_buffer`
    pub async fn break_now(&self, script_buffer: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready("break")?;
        let sent = inner.fan_out(script_buffer, |tid| Command::BreakNow { tid }).await?;
        tracing::debug!(script_buffer, threads = sent, "Break requested");
        Ok(())
    }

    /// Ask for a fresh thread list; applied by a later [`update`](Self::update)
    pub async fn refresh_threads(&self) -> Result<()> {
        self.request(Command::GetThreads, "refresh threads").await
    }

    pub async fn request_ip(&self, tid: ThreadId) -> Result<()> {
        self.request(Command::GetIp { tid }, "read instruction pointer").await
    }

    pub async fn request_local_var(&self, tid: ThreadId, var: u32) -> Result<()> {
        self.request(Command::GetLocalVar { tid, var }, "read local variable").await
    }

    pub async fn request_global_var(&self, var: u32) -> Result<()> {
        self.request(Command::GetGlobalVar { var }, "read global variable").await
    }

    pub async fn request_global_flag(&self, flag: u32) -> Result<()> {
        self.request(Command::GetGlobalFlag { flag }, "read global flag").await
    }

    async fn request(&self, cmd: Command, action: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready(action)?;
        inner.send(cmd).await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Snapshot of the current thread list
    pub async fn threads(&self) -> ThreadMap {
        self.inner.lock().await.registry.threads().clone()
    }

    /// Armed breakpoints, sorted by script buffer then address
    pub async fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner.lock().await.registry.breakpoints().cloned().collect()
    }

    /// Message of the error that closed the session, if any
    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut conn) = inner.conn.take() {
            conn.shutdown().await;
            tracing::info!(addr = %self.addr, "Debug session closed");
        }
        inner.state = SessionState::Closed;
        inner.registry.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(SessionState::AwaitingInitialSync.to_string(), "awaiting initial sync");
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.timeouts.initial_sync_secs = 9;
        config.timeouts.send_millis = 250;

        let options = SessionOptions::from(&config);
        assert_eq!(options.initial_sync_timeout, Duration::from_secs(9));
        assert_eq!(options.connection.send_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_operations_rejected_outside_ready() {
        let mut inner = Inner::new();
        assert!(matches!(inner.ensure_ready("set breakpoint"), Err(Error::InvalidState { .. })));

        inner.state = SessionState::Closed;
        assert!(matches!(inner.ensure_ready("set breakpoint"), Err(Error::SessionClosed)));

        inner.state = SessionState::Ready;
        assert!(inner.ensure_ready("set breakpoint").is_ok());
    }

    #[test]
    fn test_fatal_error_closes_and_records() {
        let mut inner = Inner::new();
        inner.state = SessionState::Ready;

        let err = inner.fail(Error::unknown_script_buffer("main"));
        assert!(matches!(err, Error::UnknownScriptBuffer(_)));
        assert_eq!(inner.state, SessionState::Ready);
        assert!(inner.last_error.is_none());

        inner.fail(Error::ConnectionClosed);
        assert_eq!(inner.state, SessionState::Closed);
        assert_eq!(inner.last_error.as_deref(), Some("Target closed the connection"));
    }

    #[test]
    fn test_debugger_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Debugger>();
    }
}
