//! Select-friendly bounded queues.
//!
//! A [`Queue`] is a bounded multi-producer multi-consumer FIFO whose
//! occupancy is mirrored by two [`Flag`]s, `not_empty` and `not_full`, so
//! both directions can participate in [`select`](crate::select::select).
//! Blocking operations are built on `select` and therefore honour the
//! current context's cancellation and deadline.

use crate::awaitable::Awaitable;
use crate::error::{Error, Result};
use crate::sync::flag::Flag;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Flag,
    not_full: Flag,
}

impl<T> QueueInner<T> {
    /// Mirrors occupancy into the readiness flags. Called with the items
    /// lock held so flag state cannot lag behind the queue.
    fn update_flags(&self, items: &VecDeque<T>) {
        if items.is_empty() {
            self.not_empty.reset();
        } else {
            self.not_empty.set();
        }
        if items.len() == self.capacity {
            self.not_full.reset();
        } else {
            self.not_full.set();
        }
    }
}

/// A bounded FIFO with fd-style readiness. Cloning shares the queue.
pub struct Queue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Errors
    ///
    /// Fails if the readiness descriptors cannot be allocated.
    ///
    /// # Panics
    ///
    /// Debug builds panic on a zero capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        debug_assert!(capacity > 0, "queue capacity must be positive");
        let inner = QueueInner {
            items: Mutex::new(VecDeque::new()),
            capacity,
            not_empty: Flag::new()?,
            not_full: Flag::new()?,
        };
        inner.not_full.set();
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Returns true when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Returns the maximum number of items the queue holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Appends `item` if there is room, handing it back otherwise.
    pub fn try_put(&self, item: T) -> core::result::Result<(), T> {
        let mut items = self.inner.items.lock();
        if items.len() == self.inner.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.inner.update_flags(&items);
        Ok(())
    }

    /// Appends `item`, failing with `try_again` when the queue is full.
    ///
    /// # Errors
    ///
    /// `try_again` when full; the item is dropped in that case. Use
    /// [`try_put`](Self::try_put) to get the item back instead.
    pub fn maybe_put(&self, item: T) -> Result<()> {
        self.try_put(item)
            .map_err(|_| Error::try_again("queue is full"))
    }

    /// Removes the oldest item, failing with `try_again` when empty.
    ///
    /// # Errors
    ///
    /// `try_again` when the queue is empty.
    pub fn maybe_get(&self) -> Result<T> {
        let mut items = self.inner.items.lock();
        let item = items
            .pop_front()
            .ok_or_else(|| Error::try_again("queue is empty"))?;
        self.inner.update_flags(&items);
        Ok(item)
    }

    /// Blocks until the item is queued.
    ///
    /// # Errors
    ///
    /// `cancelled` or `deadline_exceeded` from the current context.
    pub fn put(&self, item: T) -> Result<()> {
        let _ = crate::select::select((self.async_put(item),))?;
        Ok(())
    }

    /// Blocks until an item is available and removes it.
    ///
    /// # Errors
    ///
    /// `cancelled` or `deadline_exceeded` from the current context.
    pub fn get(&self) -> Result<T> {
        let (item,) = crate::select::select((self.async_get(),))?;
        item.ok_or_else(|| Error::internal("select returned without a queue item"))
    }

    /// An awaitable that fires while the queue has room.
    #[must_use]
    pub fn can_put(&self) -> Awaitable<'static, ()> {
        self.inner.not_full.async_wait()
    }

    /// An awaitable that fires while the queue has items.
    #[must_use]
    pub fn can_get(&self) -> Awaitable<'static, ()> {
        self.inner.not_empty.async_wait()
    }

    /// An awaitable that appends `item` once there is room.
    ///
    /// A producer that loses the race to a slot simply keeps waiting; the
    /// item stays inside the awaitable until delivered.
    #[must_use]
    pub fn async_put(&self, item: T) -> Awaitable<'static, ()> {
        let queue = self.clone();
        let mut slot = Some(item);
        self.can_put().and_then(move |()| {
            let item = slot
                .take()
                .ok_or_else(|| Error::internal("async_put reaction ran after delivery"))?;
            match queue.try_put(item) {
                Ok(()) => Ok(()),
                Err(item) => {
                    slot = Some(item);
                    Err(Error::try_again("queue is full"))
                }
            }
        })
    }

    /// An awaitable that removes the oldest item once one is available.
    #[must_use]
    pub fn async_get(&self) -> Awaitable<'static, T> {
        let queue = self.clone();
        self.can_get().and_then(move |()| queue.maybe_get())
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.inner.items.lock().len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::select;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let q = Queue::new(8).unwrap();
        for i in 0..5 {
            q.put(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.get().unwrap(), i);
        }
    }

    #[test]
    fn maybe_get_on_empty_is_try_again() {
        let q: Queue<u32> = Queue::new(2).unwrap();
        assert!(q.maybe_get().unwrap_err().is_try_again());
    }

    #[test]
    fn try_put_hands_back_on_full() {
        let q = Queue::new(1).unwrap();
        q.put("a").unwrap();
        assert_eq!(q.try_put("b"), Err("b"));
        assert!(q.maybe_put("c").unwrap_err().is_try_again());
    }

    #[test]
    fn readiness_flags_track_occupancy() {
        let q = Queue::new(1).unwrap();
        assert!(!q.inner.not_empty.is_set());
        assert!(q.inner.not_full.is_set());
        q.put(1u8).unwrap();
        assert!(q.inner.not_empty.is_set());
        assert!(!q.inner.not_full.is_set());
        q.get().unwrap();
        assert!(!q.inner.not_empty.is_set());
        assert!(q.inner.not_full.is_set());
    }

    #[test]
    fn blocking_get_sees_item_from_another_thread() {
        let q = Queue::new(4).unwrap();
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(99u32).unwrap();
        });
        assert_eq!(q.get().unwrap(), 99);
        handle.join().unwrap();
    }

    #[test]
    fn blocking_put_waits_for_room() {
        let q = Queue::new(1).unwrap();
        q.put(1u32).unwrap();
        let consumer = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            consumer.get().unwrap()
        });
        q.put(2).unwrap();
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(q.get().unwrap(), 2);
    }

    #[test]
    fn async_get_in_select_with_timer() {
        let q: Queue<u32> = Queue::new(2).unwrap();
        q.put(5).unwrap();
        let (item, timer) = select((
            q.async_get(),
            crate::awaitable::timeout(Duration::from_secs(5)),
        ))
        .unwrap();
        assert_eq!(item, Some(5));
        assert_eq!(timer, None);
    }

    #[test]
    fn two_consumers_drain_each_item_once() {
        let q = Queue::new(16).unwrap();
        for i in 0..100u32 {
            q.put(i).unwrap();
        }
        // A competitor steals items while we drain; every wake that loses
        // the race must retry instead of failing.
        let other = q.clone();
        let handle = std::thread::spawn(move || {
            let mut got = Vec::new();
            while let Ok(v) = other.maybe_get() {
                got.push(v);
            }
            got
        });
        let mut mine = Vec::new();
        while let Ok(v) = q.maybe_get() {
            mine.push(v);
        }
        let mut all = handle.join().unwrap();
        all.extend(mine);
        all.sort_unstable();
        assert_eq!(all.len(), 100);
        all.dedup();
        assert_eq!(all.len(), 100);
    }
}
