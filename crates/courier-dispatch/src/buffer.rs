use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

/// Fallback capacity when a tenant's batch config carries a non-positive
/// max size.
pub const DEFAULT_MAX_SIZE: usize = 50;

/// Receiving side of a buffer's ready signal. Yields a unit per coalesced
/// signal and closes when the buffer closes.
pub type BufferReady = mpsc::Receiver<()>;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    // capacity-1 sender: at most one pending signal, so drain loops never
    // wake-storm
    ready: Option<mpsc::Sender<()>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    max_size: usize,
}

impl<T> Shared<T> {
    fn signal_ready(state: &State<T>) {
        if let Some(ready) = &state.ready {
            // full channel means a signal is already pending; coalesce
            let _ = ready.try_send(());
        }
    }
}

/// Fixed-capacity FIFO buffer with a coalesced ready signal and a periodic
/// flush tick. The batching dispatcher keeps one per (tenant, channel).
///
/// `push` never blocks; the ready signal fires when the buffer reaches its
/// high-watermark (capacity − 1) or when a flush tick finds it non-empty.
pub struct Buffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Buffer<T> {
    /// Creates the buffer and its ready receiver. A periodic flush task runs
    /// until the buffer is closed or dropped.
    pub fn new(max_size: i32, flush_period: Duration) -> (Self, BufferReady) {
        let max_size = if max_size <= 0 {
            DEFAULT_MAX_SIZE
        } else {
            max_size as usize
        };
        let flush_period = if flush_period.is_zero() {
            Duration::from_secs(30)
        } else {
            flush_period
        };

        let (ready_tx, ready_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(max_size),
                closed: false,
                ready: Some(ready_tx),
            }),
            max_size,
        });

        tokio::spawn(periodic_flush(Arc::downgrade(&shared), flush_period));

        (Self { shared }, ready_rx)
    }

    /// Appends an item. A full or closed buffer hands the item back so the
    /// caller can fall through to the immediate path — never dropping it.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.shared.state.lock().expect("buffer lock poisoned");
        if state.closed || state.items.len() >= self.shared.max_size {
            return Err(item);
        }
        state.items.push_back(item);
        if state.items.len() >= self.shared.max_size.saturating_sub(1) {
            Shared::signal_ready(&state);
        }
        Ok(())
    }

    /// Drains and returns the current contents in FIFO order.
    pub fn pop_all(&self) -> Vec<T> {
        let mut state = self.shared.state.lock().expect("buffer lock poisoned");
        state.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().expect("buffer lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent close: subsequent `push` calls are rejected and the ready
    /// channel closes, which the drain loop takes as its cue for a final
    /// drain.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().expect("buffer lock poisoned");
        state.closed = true;
        state.ready = None;
    }
}

async fn periodic_flush<T>(shared: Weak<Shared<T>>, flush_period: Duration) {
    let mut ticker = tokio::time::interval(flush_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; skip it
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let state = shared.state.lock().expect("buffer lock poisoned");
        if state.closed {
            return;
        }
        if !state.items.is_empty() {
            trace!(len = state.items.len(), "Flush tick signaled buffer drain");
            Shared::signal_ready(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_preserves_fifo_order() {
        let (buffer, _ready) = Buffer::new(10, Duration::from_secs(30));
        for i in 0..5 {
            assert!(buffer.push(i).is_ok());
        }
        assert_eq!(buffer.pop_all(), vec![0, 1, 2, 3, 4]);
        assert!(buffer.pop_all().is_empty());
    }

    #[tokio::test]
    async fn push_rejects_when_full() {
        let (buffer, _ready) = Buffer::new(2, Duration::from_secs(30));
        assert!(buffer.push(1).is_ok());
        assert!(buffer.push(2).is_ok());
        assert_eq!(buffer.push(3), Err(3));
        assert_eq!(buffer.pop_all(), vec![1, 2]);
        // capacity freed again
        assert!(buffer.push(4).is_ok());
    }

    #[tokio::test]
    async fn high_watermark_signals_ready() {
        let (buffer, mut ready) = Buffer::new(3, Duration::from_secs(3600));
        assert!(buffer.push(1).is_ok());
        assert!(ready.try_recv().is_err());
        assert!(buffer.push(2).is_ok()); // len == capacity - 1
        assert!(ready.try_recv().is_ok());
    }

    #[tokio::test]
    async fn ready_signal_is_coalesced() {
        let (buffer, mut ready) = Buffer::new(3, Duration::from_secs(3600));
        for i in 0..3 {
            let _ = buffer.push(i);
        }
        assert!(ready.try_recv().is_ok());
        // two high-watermark pushes produced a single pending signal
        assert!(ready.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_tick_fires_only_when_non_empty() {
        let (buffer, mut ready) = Buffer::new(100, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(ready.try_recv().is_err());

        assert!(buffer.push(1).is_ok());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(ready.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_pushes() {
        let (buffer, mut ready) = Buffer::new(10, Duration::from_secs(30));
        assert!(buffer.push(1).is_ok());
        buffer.close();
        buffer.close();
        assert_eq!(buffer.push(2), Err(2));
        // remaining items still drain after close
        assert_eq!(buffer.pop_all(), vec![1]);
        // ready channel is closed
        assert!(ready.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn default_capacity_applies_for_non_positive_sizes() {
        let (buffer, _ready) = Buffer::new(0, Duration::from_secs(30));
        for i in 0..DEFAULT_MAX_SIZE as i32 {
            assert!(buffer.push(i).is_ok());
        }
        assert_eq!(buffer.push(-1), Err(-1));
    }
}
