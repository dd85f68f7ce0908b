//! 无锁单生产者/单消费者环形缓冲区 (SPSC Ring Buffer)
//!
//! 固定容量 `C` 个槽位, 始终保留一个空槽, 因此最多容纳 `C - 1` 个元素:
//! - 空: `read == write`
//! - 满: `(write + 1) % C == read`
//!
//! 只有生产者推进 `write`, 只有消费者推进 `read`. 写索引以 `Release` 发布, 消费者以
//! `Acquire` 观察后才读取槽位; 读索引对称. 所有操作 O(1), 无锁, 无重试.
//!
//! SPSC 约束由类型保证: [`RingBuffer::split`] 返回不可 `Clone` 的 [`Producer`] 与
//! [`Consumer`], 修改操作都需要 `&mut self`.
//!
//! ```
//! use netravision_rs::ring_buffer::RingBuffer;
//!
//! let (mut tx, mut rx) = RingBuffer::new(4).split();
//! tx.push(1).unwrap();
//! tx.push(2).unwrap();
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! assert_eq!(rx.pop(), None);
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// 释放策略: 元素未交给调用方就被移除时 (release_front / 缓冲区销毁) 调用
pub type ReleaseFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct Shared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    read: CachePadded<AtomicUsize>,
    write: CachePadded<AtomicUsize>,
    release: Option<ReleaseFn<T>>,
}

// 槽位访问由读写索引划分所有权: 生产者只写 [write], 消费者只读 [read].
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(capacity: usize, release: Option<ReleaseFn<T>>) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be >= 2, got {capacity}");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            read: CachePadded::new(AtomicUsize::new(0)),
            write: CachePadded::new(AtomicUsize::new(0)),
            release,
        }
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }

    /// # Safety
    /// 同一时刻只能有一个线程调用生产者侧方法.
    unsafe fn push(&self, value: T) -> Result<(), T> {
        let write = self.write.load(Ordering::Relaxed);
        let next = self.next(write);
        if next == self.read.load(Ordering::Acquire) {
            return Err(value);
        }
        (*self.slots[write].get()).write(value);
        self.write.store(next, Ordering::Release);
        Ok(())
    }

    /// # Safety
    /// 同一时刻只能有一个线程调用消费者侧方法.
    unsafe fn pop(&self) -> Option<T> {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }
        let value = (*self.slots[read].get()).assume_init_read();
        self.read.store(self.next(read), Ordering::Release);
        Some(value)
    }

    /// # Safety
    /// 同 [`Shared::pop`].
    unsafe fn pop_with<F: FnOnce(&mut T)>(&self, visitor: F) -> bool {
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return false;
        }
        let slot = &mut *self.slots[read].get();
        visitor(slot.assume_init_mut());
        slot.assume_init_drop();
        self.read.store(self.next(read), Ordering::Release);
        true
    }

    /// # Safety
    /// 同 [`Shared::pop`].
    unsafe fn release_front(&self) -> bool {
        match self.pop() {
            Some(value) => {
                self.release_value(value);
                true
            }
            None => false,
        }
    }

    fn release_value(&self, value: T) {
        match &self.release {
            Some(release) => release(value),
            None => drop(value),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    fn is_full(&self) -> bool {
        self.next(self.write.load(Ordering::Acquire)) == self.read.load(Ordering::Acquire)
    }

    fn size_guess(&self) -> usize {
        let capacity = self.slots.len();
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        (write + capacity - read) % capacity
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // 剩余元素按 FIFO 顺序走释放策略
        let mut read = *self.read.get_mut();
        let write = *self.write.get_mut();
        while read != write {
            let value = unsafe { self.slots[read].get_mut().assume_init_read() };
            self.release_value(value);
            read = self.next(read);
        }
        *self.read.get_mut() = write;
    }
}

/// 未拆分的环形缓冲区, 单线程持有时可同时 push / pop
pub struct RingBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingBuffer<T> {
    /// 创建容量为 `capacity` 个槽位的缓冲区 (可用 `capacity - 1`)
    ///
    /// # Panics
    /// `capacity < 2` 时 panic.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared::new(capacity, None)),
        }
    }

    /// 带释放策略的缓冲区
    pub fn with_release<F>(capacity: usize, release: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared::new(capacity, Some(Box::new(release)))),
        }
    }

    /// 写入; 缓冲区已满时原样返回 `Err(value)`
    pub fn push(&mut self, value: T) -> Result<(), T> {
        unsafe { self.shared.push(value) }
    }

    /// 移出最旧元素, 不触发释放策略
    pub fn pop(&mut self) -> Option<T> {
        unsafe { self.shared.pop() }
    }

    /// 原地访问最旧元素后丢弃它
    pub fn pop_with<F: FnOnce(&mut T)>(&mut self, visitor: F) -> bool {
        unsafe { self.shared.pop_with(visitor) }
    }

    /// 移除最旧元素并交给释放策略
    pub fn release_front(&mut self) -> bool {
        unsafe { self.shared.release_front() }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    pub fn size_guess(&self) -> usize {
        self.shared.size_guess()
    }

    /// 可用容量 (`C - 1`)
    pub fn capacity(&self) -> usize {
        self.shared.slots.len() - 1
    }

    /// 拆分为生产端与消费端
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        (
            Producer {
                shared: Arc::clone(&self.shared),
            },
            Consumer {
                shared: self.shared,
            },
        )
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("size_guess", &self.size_guess())
            .finish()
    }
}

/// 生产端: 唯一允许推进写索引的句柄
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    pub fn push(&mut self, value: T) -> Result<(), T> {
        unsafe { self.shared.push(value) }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    /// 生产端观察到的是上界
    pub fn size_guess(&self) -> usize {
        self.shared.size_guess()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len() - 1
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// 消费端: 唯一允许推进读索引的句柄
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        unsafe { self.shared.pop() }
    }

    pub fn pop_with<F: FnOnce(&mut T)>(&mut self, visitor: F) -> bool {
        unsafe { self.shared.pop_with(visitor) }
    }

    pub fn release_front(&mut self) -> bool {
        unsafe { self.shared.release_front() }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    /// 消费端观察到的是下界
    pub fn size_guess(&self) -> usize {
        self.shared.size_guess()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len() - 1
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn holds_capacity_minus_one() {
        for capacity in 2..=10 {
            let mut rb = RingBuffer::new(capacity);
            assert_eq!(rb.capacity(), capacity - 1);
            for i in 0..capacity - 1 {
                assert!(!rb.is_full());
                assert!(rb.push(i).is_ok(), "capacity {capacity}, push {i}");
            }
            assert!(rb.is_full());
            assert_eq!(rb.push(usize::MAX), Err(usize::MAX));
            assert_eq!(rb.size_guess(), capacity - 1);
        }
    }

    #[test]
    fn full_push_does_not_overwrite() {
        let mut rb = RingBuffer::new(3);
        rb.push("a").unwrap();
        rb.push("b").unwrap();
        assert_eq!(rb.push("c"), Err("c"));
        assert_eq!(rb.pop(), Some("a"));
        assert_eq!(rb.pop(), Some("b"));
        assert_eq!(rb.pop(), None);
    }

    #[test]
    fn empty_pop_keeps_state() {
        let mut rb: RingBuffer<u32> = RingBuffer::new(4);
        assert!(rb.is_empty());
        assert_eq!(rb.pop(), None);
        assert!(!rb.pop_with(|_| {}));
        assert!(!rb.release_front());
        assert!(rb.is_empty());
        assert_eq!(rb.size_guess(), 0);

        rb.push(7).unwrap();
        assert_eq!(rb.pop(), Some(7));
    }

    #[test]
    fn fifo_across_wraparound() {
        let mut rb = RingBuffer::new(4);
        let mut expected = 0;
        let mut next = 0;
        for round in 0..50 {
            let pushes = round % 4;
            for _ in 0..pushes {
                if rb.push(next).is_ok() {
                    next += 1;
                }
            }
            while let Some(v) = rb.pop() {
                assert_eq!(v, expected);
                expected += 1;
            }
        }
        assert_eq!(expected, next);
    }

    #[test]
    fn pop_with_visits_in_place() {
        let mut rb = RingBuffer::new(4);
        rb.push(vec![1, 2, 3]).unwrap();
        let mut seen = 0;
        assert!(rb.pop_with(|v| {
            v.push(4);
            seen = v.len();
        }));
        assert_eq!(seen, 4);
        assert!(rb.is_empty());
    }

    #[test]
    fn drop_releases_remaining_in_fifo_order() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let mut rb = RingBuffer::with_release(6, move |v: u32| sink.lock().push(v));
        for v in 0..5 {
            rb.push(v).unwrap();
        }
        assert_eq!(rb.pop(), Some(0));
        drop(rb);
        assert_eq!(*released.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn pop_bypasses_release_policy() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut rb = RingBuffer::with_release(4, move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rb.push(1).unwrap();
        rb.push(2).unwrap();
        rb.push(3).unwrap();
        assert_eq!(rb.pop(), Some(1));
        assert!(rb.pop_with(|_| {}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(rb.release_front());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(rb);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_element_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut rb = RingBuffer::new(5);
            for _ in 0..4 {
                assert!(rb.push(DropCounter(Arc::clone(&drops))).is_ok());
            }
            let rejected = rb.push(DropCounter(Arc::clone(&drops)));
            assert!(rejected.is_err());
            drop(rejected);
            assert_eq!(drops.load(Ordering::SeqCst), 1);

            drop(rb.pop());
            assert!(rb.pop_with(|_| {}));
            assert!(rb.release_front());
            assert_eq!(drops.load(Ordering::SeqCst), 4);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cross_thread_transfer_keeps_order() {
        const N: u64 = 10_000;
        let (mut tx, mut rx) = RingBuffer::new(8).split();

        let producer = thread::spawn(move || {
            for i in 0..N {
                let mut value = i;
                loop {
                    match tx.push(value) {
                        Ok(()) => break,
                        Err(v) => {
                            value = v;
                            if rand::random::<u8>() < 32 {
                                thread::yield_now();
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < N {
            match rx.pop() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }

    #[test]
    fn split_handles_report_capacity() {
        let (tx, rx) = RingBuffer::<u8>::new(16).split();
        assert_eq!(tx.capacity(), 15);
        assert_eq!(rx.capacity(), 15);
        assert!(tx.is_empty() && rx.is_empty());
    }

    #[test]
    #[should_panic]
    fn rejects_capacity_below_two() {
        let _ = RingBuffer::<u8>::new(1);
    }
}
