//! Pipe-queue: a bounded, blocking queue between one process's
//! `StreamReader` and another's `StreamWriter`, terminated by a `None`
//! sentinel.
//!
//! Uses the same `Arc<Mutex<..>> + Condvar` shape as the crate's other
//! watcher primitives, adapted here for a bounded MPSC channel with
//! back-pressure instead of a stop flag.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<Option<T>>,
    closed: bool,
    /// Set once the last `PipeReceiver` is dropped. Lets a blocked `put`
    /// unblock instead of hanging forever when a downstream pipeline stage
    /// exits early and nobody will ever drain the queue again.
    receiver_gone: bool,
    receiver_refs: usize,
    capacity: usize,
}

/// The sending half. Cloneable so a single `StreamReader` can share it with
/// its `close()` path without an extra indirection.
#[derive(Debug, Clone)]
pub struct PipeSender<T> {
    state: Arc<(Mutex<Inner<T>>, Condvar, Condvar)>,
}

/// The receiving half, consumed by a downstream `StreamWriter` or by
/// `RunningCommand` iteration.
#[derive(Debug)]
pub struct PipeReceiver<T> {
    state: Arc<(Mutex<Inner<T>>, Condvar, Condvar)>,
}

/// Create a bounded pipe-queue. `capacity` caps the number of in-flight
/// chunks before `put` blocks, giving genuine back-pressure when a
/// pipe-queue is acting as a downstream sink.
pub fn channel<T>(capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let inner = Inner {
        items: VecDeque::new(),
        closed: false,
        receiver_gone: false,
        receiver_refs: 1,
        capacity: capacity.max(1),
    };
    let state = Arc::new((Mutex::new(inner), Condvar::new(), Condvar::new()));
    (
        PipeSender {
            state: Arc::clone(&state),
        },
        PipeReceiver { state },
    )
}

impl<T> Clone for PipeReceiver<T> {
    fn clone(&self) -> Self {
        let (lock, ..) = &*self.state;
        lock.lock().expect("pipe-queue mutex poisoned").receiver_refs += 1;
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Drop for PipeReceiver<T> {
    fn drop(&mut self) {
        let (lock, not_full, _not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        inner.receiver_refs -= 1;
        if inner.receiver_refs == 0 {
            inner.receiver_gone = true;
            not_full.notify_all();
        }
    }
}

impl<T> PipeSender<T> {
    /// Push a chunk, blocking while the queue is full. Once the receiving
    /// end has been dropped, this becomes a no-op instead of blocking
    /// forever, so an early-exiting downstream pipeline stage looks like a
    /// clean exit to whatever is still writing upstream.
    pub fn put(&self, item: T) {
        let (lock, not_full, not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        while inner.items.len() >= inner.capacity && !inner.closed && !inner.receiver_gone {
            inner = not_full.wait(inner).expect("pipe-queue mutex poisoned");
        }
        if inner.closed || inner.receiver_gone {
            return;
        }
        inner.items.push_back(Some(item));
        not_empty.notify_one();
    }

    /// Terminate the queue with the `None` sentinel once the producer
    /// closes its end. Idempotent.
    pub fn close(&self) {
        let (lock, _not_full, not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        if !inner.closed {
            inner.items.push_back(None);
            inner.closed = true;
        }
        not_empty.notify_all();
    }
}

impl<T> PipeReceiver<T> {
    /// Block until a chunk or the terminal `None` sentinel arrives.
    /// Returns `None` once the sentinel has been consumed.
    pub fn get(&self) -> Option<T> {
        let (lock, not_full, not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        loop {
            if let Some(front) = inner.items.pop_front() {
                not_full.notify_one();
                return front;
            }
            inner = not_empty.wait(inner).expect("pipe-queue mutex poisoned");
        }
    }

    /// Non-blocking variant used by `iter_noblock`: returns `Ok(None)` on a
    /// consumed sentinel, `Err(())` if nothing is ready yet.
    pub fn try_get(&self) -> Result<Option<T>, WouldBlock> {
        let (lock, not_full, _not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        match inner.items.pop_front() {
            Some(front) => {
                not_full.notify_one();
                Ok(front)
            }
            None => Err(WouldBlock),
        }
    }

    /// Block up to `timeout` for the next item; used by `wait(timeout=..)`
    /// composition in tests and by the async adapter's polling loop.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Option<T>> {
        let (lock, not_full, not_empty) = &*self.state;
        let mut inner = lock.lock().expect("pipe-queue mutex poisoned");
        loop {
            if let Some(front) = inner.items.pop_front() {
                not_full.notify_one();
                return Some(front);
            }
            let (guard, timeout_result) = not_empty
                .wait_timeout(inner, timeout)
                .expect("pipe-queue mutex poisoned");
            inner = guard;
            if timeout_result.timed_out() {
                return None;
            }
        }
    }
}

/// Distinguished "no chunk ready yet" token returned by `iter_noblock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn put_then_get_preserves_order() {
        let (tx, rx) = channel::<i32>(8);
        tx.put(1);
        tx.put(2);
        tx.put(3);
        assert_eq!(rx.get(), Some(1));
        assert_eq!(rx.get(), Some(2));
        assert_eq!(rx.get(), Some(3));
    }

    #[test]
    fn close_terminates_with_none_sentinel() {
        let (tx, rx) = channel::<i32>(8);
        tx.put(1);
        tx.close();
        assert_eq!(rx.get(), Some(1));
        assert_eq!(rx.get(), None);
    }

    #[test]
    fn try_get_reports_would_block_on_empty_open_queue() {
        let (_tx, rx) = channel::<i32>(8);
        assert_eq!(rx.try_get(), Err(WouldBlock));
    }

    #[test]
    fn capacity_provides_back_pressure() {
        let (tx, rx) = channel::<i32>(1);
        tx.put(1);
        let tx2 = tx.clone();
        let handle = thread::spawn(move || {
            tx2.put(2);
        });
        // The second put should block until we drain one item.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.get(), Some(1));
        handle.join().unwrap();
        assert_eq!(rx.get(), Some(2));
    }

    #[test]
    fn get_timeout_returns_none_when_nothing_arrives() {
        let (_tx, rx) = channel::<i32>(8);
        assert_eq!(rx.get_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn dropping_the_receiver_unblocks_a_full_put() {
        let (tx, rx) = channel::<i32>(1);
        tx.put(1);
        drop(rx);
        let handle = thread::spawn(move || {
            // Would block forever against the old implementation once the
            // queue is full and nobody is left to drain it.
            tx.put(2);
        });
        handle.join().expect("put should return once the receiver is gone");
    }
}
