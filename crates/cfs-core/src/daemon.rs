//! Background thread driving cache write-back and the debounced table
//! persist.

use crate::fs::ContigFs;
use cfs_block::CacheConfig;
use cfs_error::{CfsError, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushDaemonConfig {
    pub period_ms: u64,
    pub max_flushes: usize,
}

impl Default for FlushDaemonConfig {
    fn default() -> Self {
        Self::from_cache_config(&CacheConfig::default())
    }
}

impl FlushDaemonConfig {
    #[must_use]
    pub fn from_cache_config(config: &CacheConfig) -> Self {
        Self {
            period_ms: config.flush_period_ms,
            max_flushes: config.max_flushes_per_tick,
        }
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic flusher. Stops and joins its thread on [`FlushDaemon::stop`]
/// or drop.
#[derive(Debug)]
pub struct FlushDaemon {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub fn spawn(fs: Arc<ContigFs>, config: FlushDaemonConfig) -> Result<Self> {
        if config.period_ms == 0 || config.max_flushes == 0 {
            return Err(CfsError::InvalidArgument(
                "flush daemon needs a non-zero period and flush budget".to_owned(),
            ));
        }
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let thread = std::thread::Builder::new()
            .name("cfs-flush".to_owned())
            .spawn(move || run(&fs, config, &thread_signal))?;
        debug!(target: "cfs::daemon", period_ms = config.period_ms, "spawned");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "cfs::daemon", "flush thread panicked");
            }
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(fs: &ContigFs, config: FlushDaemonConfig, signal: &StopSignal) {
    let period = Duration::from_millis(config.period_ms);
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, period);
            }
            if *stopped {
                break;
            }
        }

        match fs.cache().tick(config.period_ms, config.max_flushes) {
            Ok(flushed) if flushed > 0 => {
                trace!(target: "cfs::daemon", flushed, "cache_tick");
            }
            Ok(_) => {}
            Err(err) => error!(target: "cfs::daemon", error = %err, "cache_tick_failed"),
        }
        match fs.tick(config.period_ms) {
            Ok(true) => trace!(target: "cfs::daemon", "table_persisted"),
            Ok(false) => {}
            Err(err) => error!(target: "cfs::daemon", error = %err, "table_persist_failed"),
        }
    }
    debug!(target: "cfs::daemon", "stopped");
}
