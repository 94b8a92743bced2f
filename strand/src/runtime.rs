//! The runtime: an [`IoManager`] sized from the configuration, plus the glue to drive it from
//! ordinary synchronous code.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use log::info;
use metrics::{counter, gauge};
use parking_lot::Mutex;

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::hook;
use crate::reactor::{IoHandle, IoManager};
use crate::scheduler::Handle;

/// Installs `env_logger` as the log sink, honouring `RUST_LOG`. Does nothing if a logger is
/// already installed.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

pub struct Runtime {
    io: IoManager,
}

impl Runtime {
    /// Creates a runtime from the active configuration.
    pub fn new() -> Result<Self> {
        Self::with_config((*config::get()).clone())
    }

    /// Installs `config` as the active configuration and starts a runtime from it.
    ///
    /// The worker pool never includes the calling thread (`scheduler.use_caller` is ignored):
    /// that thread waits in [`block_on`](Self::block_on) instead. If `metrics.listen` is set,
    /// a Prometheus exporter is started on that address.
    pub fn with_config(config: Config) -> Result<Self> {
        hook::watch_config();
        config::set(config.clone())?;

        if let Some(addr) = config.metrics.listen {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            info!("metrics enabled at http://{addr}/metrics");
        }

        let s = &config.scheduler;
        let io = IoManager::new(s.threads, false, &s.name)?;
        info!("runtime {} started with {} workers", s.name, s.threads);
        Ok(Self { io })
    }

    pub fn handle(&self) -> &IoHandle {
        self.io.io_handle()
    }

    /// Runs `f` on a worker fiber in the background.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        spawn_on(self.io.handle(), f);
    }

    /// Runs `f` on a worker fiber and blocks the calling thread until it returns. A panic in
    /// `f` is resumed on the calling thread.
    pub fn block_on<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let thread = thread::current();

        let result = slot.clone();
        self.io.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            *result.lock() = Some(outcome);
            thread.unpark();
        });

        loop {
            if let Some(outcome) = slot.lock().take() {
                match outcome {
                    Ok(value) => return value,
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            thread::park();
        }
    }

    /// Waits for all outstanding work, then shuts the workers down.
    pub fn shutdown(self) {
        self.io.stop();
    }
}

fn spawn_on<F>(handle: &Handle, f: F)
where
    F: FnOnce() + Send + 'static,
{
    counter!("strand_tasks_spawned_total").increment(1);
    gauge!("strand_tasks_pending").increment(1.0);
    handle.spawn(move || {
        gauge!("strand_tasks_pending").decrement(1.0);
        f();
    });
}

/// Spawns `f` onto the scheduler running the current thread.
///
/// # Panics
///
/// Panics if called outside of a runtime worker.
///
/// # Examples
///
/// ```ignore
/// #[strand::main]
/// fn main() {
///     strand::spawn(|| println!("spawned task"));
/// }
/// ```
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let handle = Handle::current().expect("strand: spawn called outside of a runtime context");
    spawn_on(&handle, f);
}
