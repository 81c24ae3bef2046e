use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tlswatch_common::{PROC_EXEC, PROC_EXIT};

/// Queue bound used when the configuration does not set one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Exec,
    Exit,
}

impl LifecycleAction {
    pub fn from_raw(action: u32) -> Option<Self> {
        match action {
            PROC_EXEC => Some(LifecycleAction::Exec),
            PROC_EXIT => Some(LifecycleAction::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub pid: u32,
    pub action: LifecycleAction,
    pub sequence: u64,
}

/// Bounded FIFO between lifecycle producers and the single event worker.
///
/// `push` never waits on the consumer: when the channel is full the producer
/// evicts the oldest event through its own receiver and counts it. Dropping
/// from the front keeps per-pid order among the survivors.
#[derive(Debug)]
pub struct LifecycleQueue {
    snd: Sender<LifecycleEvent>,
    recv: Receiver<LifecycleEvent>,
    // Single-slot doorbell; a pending ring is enough to wake the worker.
    bell: Sender<()>,
    bell_recv: Receiver<()>,
    sequence: AtomicU64,
    dropped: AtomicU64,
    kernel_dropped: AtomicU64,
}

impl LifecycleQueue {
    pub fn new(capacity: usize) -> Self {
        let (snd, recv) = crossbeam_channel::bounded(capacity.max(1));
        let (bell, bell_recv) = crossbeam_channel::bounded(1);
        Self {
            snd,
            recv,
            bell,
            bell_recv,
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            kernel_dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, pid: u32, action: LifecycleAction) {
        let mut event = LifecycleEvent {
            pid,
            action,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        loop {
            match self.snd.try_send(event) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    if self.recv.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    event = rejected;
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.wake();
    }

    /// Take everything queued so far, in arrival order.
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        self.recv.try_iter().collect()
    }

    /// Block the worker until something is queued, `timeout` passes or `wake` is called.
    pub fn wait(&self, timeout: Duration) {
        if self.recv.is_empty() {
            let _ = self.bell_recv.recv_timeout(timeout);
        }
    }

    pub fn wake(&self) {
        let _ = self.bell.try_send(());
    }

    pub fn len(&self) -> usize {
        self.recv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recv.is_empty()
    }

    /// Raise the count of events the kernel could not deliver. `total` is
    /// the running sum read from the kernel counter, so stale reads are ignored.
    pub fn note_kernel_drops(&self, total: u64) {
        if self.kernel_dropped.fetch_max(total, Ordering::Relaxed) < total {
            self.wake();
        }
    }

    /// Events lost on either side of the ring buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed) + self.kernel_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn test_drain_preserves_arrival_order() {
        let queue = LifecycleQueue::new(8);
        queue.push(1, LifecycleAction::Exec);
        queue.push(2, LifecycleAction::Exec);
        queue.push(1, LifecycleAction::Exit);

        let events = queue.drain();
        let seen: Vec<_> = events.iter().map(|e| (e.pid, e.action)).collect();
        assert_eq!(
            seen,
            vec![
                (1, LifecycleAction::Exec),
                (2, LifecycleAction::Exec),
                (1, LifecycleAction::Exit)
            ]
        );
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = LifecycleQueue::new(2);
        queue.push(1, LifecycleAction::Exec);
        queue.push(2, LifecycleAction::Exec);
        queue.push(3, LifecycleAction::Exec);

        assert_eq!(queue.dropped(), 1);
        let pids: Vec<u32> = queue.drain().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![2, 3]);
    }

    #[test]
    fn test_wait_returns_when_event_arrives() {
        let queue = Arc::new(LifecycleQueue::new(4));
        let producer = queue.clone();
        let start = Instant::now();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(9, LifecycleAction::Exit);
        });
        while queue.is_empty() && start.elapsed() < Duration::from_secs(5) {
            queue.wait(Duration::from_secs(1));
        }
        handle.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_kernel_drops_add_to_total() {
        let queue = LifecycleQueue::new(1);
        queue.push(1, LifecycleAction::Exec);
        queue.push(2, LifecycleAction::Exec);
        queue.note_kernel_drops(3);
        queue.note_kernel_drops(2);

        assert_eq!(queue.dropped(), 4);
        let pids: Vec<u32> = queue.drain().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![2]);
    }

    #[test]
    fn test_raw_actions() {
        assert_eq!(LifecycleAction::from_raw(PROC_EXEC), Some(LifecycleAction::Exec));
        assert_eq!(LifecycleAction::from_raw(PROC_EXIT), Some(LifecycleAction::Exit));
        assert_eq!(LifecycleAction::from_raw(0), None);
    }
}
