use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creates a connected cancel handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = bounded(1);
    let latched = Arc::new(AtomicBool::new(false));
    (
        CancelHandle {
            tx,
            latched: Arc::clone(&latched),
        },
        CancelSignal { rx, latched },
    )
}

/// Sending side, e.g. held by the key watcher.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
    latched: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.latched.store(true, Ordering::SeqCst);
        // A full channel already carries a wake-up.
        let _ = self.tx.try_send(());
    }
}

/// Receiving side, checked by the poll loops. Once cancelled it stays
/// cancelled until [`reset`](CancelSignal::reset).
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: Receiver<()>,
    latched: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`, returning early with `true` on cancellation.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                self.is_cancelled()
            }
        }
    }

    /// Arms the signal again for the next operation.
    pub fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
        self.latched.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn cancel_is_latched() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(signal.wait_for(Duration::from_secs(5)));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn wait_times_out_without_cancel() {
        let (_handle, signal) = cancel_pair();
        let start = Instant::now();
        assert!(!signal.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_from_another_thread_wakes_the_waiter() {
        let (handle, signal) = cancel_pair();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.cancel();
        });
        let start = Instant::now();
        assert!(signal.wait_for(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(10));
        t.join().unwrap();
    }

    #[test]
    fn reset_rearms() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        signal.reset();
        assert!(!signal.is_cancelled());
        assert!(!signal.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn dropped_handle_still_waits() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        let start = Instant::now();
        assert!(!signal.wait_for(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
