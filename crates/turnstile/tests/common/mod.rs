//! Shared mock driver for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use turnstile::{
    ConnectionConfig, ConnectionFactory, Error, IsolationLevel, PoolConfig, RawConnection, Result,
    TimeoutExecutorHandle,
};

/// Observable factory state shared with the test body.
#[derive(Default)]
pub struct FactoryState {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    /// All subsequent creates fail with `CreateFailed`
    pub fail_creates: AtomicBool,
    /// All subsequent `execute` calls fail at the link level
    pub break_connections: AtomicBool,
    /// Per-connection liveness flags, in creation order
    liveness: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FactoryState {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn break_connections(&self, broken: bool) {
        self.break_connections.store(broken, Ordering::SeqCst);
    }

    /// Kill every connection created so far; later creations stay alive.
    pub fn kill_existing(&self) {
        for alive in self.liveness.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
pub struct MockFactory {
    pub state: Arc<FactoryState>,
    /// Whether the mock driver advertises a native liveness check
    pub support_ping: bool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
            support_ping: true,
        }
    }

    pub fn without_ping() -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
            support_ping: false,
        }
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, _config: &ConnectionConfig) -> Result<Box<dyn RawConnection>> {
        if self.state.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::create_failed(
                "scripted create failure",
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            ));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.liveness.lock().unwrap().push(alive.clone());
        Ok(Box::new(MockConn {
            state: self.state.clone(),
            alive,
            support_ping: self.support_ping,
            closed: false,
        }))
    }
}

pub struct MockConn {
    state: Arc<FactoryState>,
    alive: Arc<AtomicBool>,
    support_ping: bool,
    closed: bool,
}

impl MockConn {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.state.break_connections.load(Ordering::SeqCst)
    }
}

impl RawConnection for MockConn {
    fn execute(&mut self, _sql: &str) -> Result<u64> {
        if !self.is_alive() {
            return Err(Error::connection("scripted link failure"));
        }
        Ok(1)
    }

    fn ping(&mut self, _timeout: Duration) -> Result<bool> {
        if self.support_ping {
            Ok(self.is_alive())
        } else {
            Err(Error::unsupported("no native liveness check"))
        }
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_auto_commit(&mut self, _auto_commit: bool) -> Result<()> {
        Ok(())
    }

    fn set_read_only(&mut self, _read_only: bool) -> Result<()> {
        Ok(())
    }

    fn set_catalog(&mut self, _catalog: &str) -> Result<()> {
        Ok(())
    }

    fn set_schema(&mut self, _schema: &str) -> Result<()> {
        Ok(())
    }

    fn isolation(&mut self) -> Result<IsolationLevel> {
        Ok(IsolationLevel::ReadCommitted)
    }

    fn set_isolation(&mut self, _isolation: IsolationLevel) -> Result<()> {
        Ok(())
    }

    fn network_timeout(&mut self) -> Result<Duration> {
        Err(Error::unsupported("no network timeout"))
    }

    fn set_network_timeout(
        &mut self,
        _executor: TimeoutExecutorHandle,
        _timeout: Duration,
    ) -> Result<()> {
        Err(Error::unsupported("no network timeout"))
    }

    fn set_query_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        assert!(!self.closed, "raw connection closed twice");
        self.closed = true;
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Base configuration for tests: short clear delays, a long idle-scan
/// period so eviction never interferes unless a test asks for it, and no
/// process exit hook.
pub fn test_config(max_size: usize, initial_size: usize) -> PoolConfig {
    PoolConfig::new("mock://local/test")
        .with_max_size(max_size)
        .with_initial_size(initial_size)
        .with_borrow_semaphore_size(max_size.max(1))
        .with_max_wait(Duration::from_secs(2))
        .with_idle_check_interval(Duration::from_secs(600))
        .with_delay_for_next_clear(Duration::from_millis(20))
        .with_exit_hook(false)
}
