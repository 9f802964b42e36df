//! The pacing worker: a long-lived thread that decides when background
//! reclamation is worth the I/O.
//!
//! Each tick sleeps an adaptive interval, then backs off while the
//! filesystem is frozen or busy and only invokes the collector when the
//! device is quiet. An empty victim scan parks the worker on the long
//! no-GC sleep so an exhausted dirty set is not spun on.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::fs::GcTarget;
use crate::gc::GcManager;
use crate::status::GcStatus;

/// Handle to the background reclamation thread.
pub struct GcWorker {
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GcWorker {
    /// Spawn the worker for `gc`. The thread is named after the host
    /// device's major:minor numbers.
    pub fn spawn<F: GcTarget>(gc: Arc<GcManager<F>>) -> io::Result<GcWorker> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (major, minor) = gc.fs().device_id();

        let handle = thread::Builder::new()
            .name(format!("gc-{major}:{minor}"))
            .spawn(move || worker_loop(gc, stop_rx))?;

        Ok(GcWorker {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the worker and wait for it to exit. Safe to call more than
    /// once; later calls do nothing.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.stop_tx.send(());
            let _ = handle.join();
        }
    }

    /// Whether the worker thread is still attached.
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<F: GcTarget>(gc: Arc<GcManager<F>>, stop_rx: Receiver<()>) {
    let mut wait_ms = gc.tuning().min_sleep_ms();

    loop {
        // The stop channel doubles as the pacing sleep, so shutdown cuts
        // through even the no-GC back-off.
        match stop_rx.recv_timeout(Duration::from_millis(wait_ms)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let fs = gc.fs();
        let tuning = gc.tuning();

        if fs.is_frozen() {
            tuning.increase_sleep(&mut wait_ms);
            continue;
        }

        // A synchronous caller owns the collector right now; skip the
        // tick entirely rather than queue behind it.
        let Some(guard) = gc.try_lock() else {
            continue;
        };

        if !fs.is_idle() {
            tuning.increase_sleep(&mut wait_ms);
            drop(guard);
            continue;
        }

        if fs.has_enough_invalid_blocks() {
            tuning.decrease_sleep(&mut wait_ms);
        } else {
            tuning.increase_sleep(&mut wait_ms);
        }

        gc.stats().inc_bg_passes();

        if gc.run_locked(false, guard) == GcStatus::NoVictim {
            wait_ms = tuning.no_gc_sleep_ms();
        }

        debug!(
            wait_ms,
            prefree = fs.prefree_segments(),
            free = fs.free_segments(),
            "background pass finished"
        );

        fs.balance_fs_bg();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::fs::mem::MemFs;
    use crate::layout::Geometry;
    use std::sync::atomic::Ordering;

    fn worker_config() -> GcConfig {
        GcConfig::new()
            .with_min_sleep_ms(5)
            .with_max_sleep_ms(20)
            .with_no_gc_sleep_ms(50)
    }

    #[test]
    fn test_spawn_and_stop() {
        let fs = MemFs::new(Geometry::new(3, 1, 16));
        let gc = Arc::new(GcManager::new(fs, worker_config()));

        let worker = GcWorker::spawn(Arc::clone(&gc)).unwrap();
        assert!(worker.is_running());

        worker.stop();
        assert!(!worker.is_running());

        // Idempotent.
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_stop_interrupts_no_gc_backoff() {
        // An empty filesystem never yields a victim, so the worker parks
        // on the long back-off; stop must still return promptly.
        let fs = MemFs::new(Geometry::new(3, 1, 16));
        fs.set_idle(true);
        let gc = Arc::new(GcManager::new(
            fs,
            worker_config().with_no_gc_sleep_ms(3_600_000),
        ));

        let worker = GcWorker::spawn(Arc::clone(&gc)).unwrap();
        thread::sleep(Duration::from_millis(60));
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_busy_device_blocks_collection() {
        let fs = MemFs::new(Geometry::new(3, 1, 16));
        fs.set_idle(false);
        let fs_handle = Arc::clone(&fs);
        let gc = Arc::new(GcManager::new(fs, worker_config()));

        let worker = GcWorker::spawn(Arc::clone(&gc)).unwrap();
        thread::sleep(Duration::from_millis(120));
        worker.stop();

        // The idle gate fires before any pass is attempted.
        assert_eq!(gc.stats().bg_passes.load(Ordering::Relaxed), 0);
        assert_eq!(fs_handle.balance_calls(), 0);
    }

    #[test]
    fn test_frozen_fs_blocks_collection() {
        let fs = MemFs::new(Geometry::new(3, 1, 16));
        fs.set_idle(true);
        fs.set_frozen(true);
        let fs_handle = Arc::clone(&fs);
        let gc = Arc::new(GcManager::new(fs, worker_config()));

        let worker = GcWorker::spawn(Arc::clone(&gc)).unwrap();
        thread::sleep(Duration::from_millis(120));
        worker.stop();

        assert_eq!(gc.stats().bg_passes.load(Ordering::Relaxed), 0);
        assert_eq!(fs_handle.balance_calls(), 0);
    }

    #[test]
    fn test_idle_fs_runs_background_passes() {
        let fs = MemFs::new(Geometry::new(3, 1, 16));
        fs.set_idle(true);
        let fs_handle = Arc::clone(&fs);
        let gc = Arc::new(GcManager::new(fs, worker_config()));

        let worker = GcWorker::spawn(Arc::clone(&gc)).unwrap();
        thread::sleep(Duration::from_millis(150));
        worker.stop();

        assert!(gc.stats().bg_passes.load(Ordering::Relaxed) >= 1);
        assert!(fs_handle.balance_calls() >= 1);
    }
}
