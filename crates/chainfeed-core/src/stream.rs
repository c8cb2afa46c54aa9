//! Bounded, multi-reader, append-only event log.
//!
//! A [`SegmentedStream`] stores items in fixed-size segments held in a
//! [`RingQueue`]. Every item gets a 1-based offset that never decreases or
//! repeats. Readers keep their own cursor (the offset of the last item they
//! saw) and ask for everything after it; nothing is tracked per reader.
//!
//! ```text
//!  segment_offset = 2 (segments evicted so far), segment_size = 4
//!
//!  evicted        retained segments (RingQueue)
//!  [1..4][5..8] | [9 10 11 12] [13 14 15 16] [17 18 _ _]
//!                 ^ first retained item = 2 * 4 + 1      ^ last offset = 18
//! ```
//!
//! When appending would need more than `max_segments` segments the oldest
//! one is dropped and its allocation reused for the new tail. Readers whose
//! cursor points into a dropped segment silently resume at the oldest
//! retained item. Producers never block on slow readers.

use std::future::Future;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::StreamConfig;
use crate::gate::BroadcastGate;
use crate::ring::RingQueue;

struct Segments<T> {
    queue: RingQueue<Vec<T>>,
    /// Number of segments evicted since the stream was created.
    evicted: u64,
}

impl<T> Segments<T> {
    fn first_offset(&self, segment_size: u64) -> u64 {
        self.evicted * segment_size
    }

    fn last_offset(&self, segment_size: u64) -> u64 {
        let Ok(tail) = self.queue.tail() else {
            return self.first_offset(segment_size);
        };
        (self.evicted + self.queue.len() as u64 - 1) * segment_size + tail.len() as u64
    }
}

/// A bounded event log addressed by monotonically increasing offsets.
pub struct SegmentedStream<T> {
    segments: RwLock<Segments<T>>,
    segment_size: usize,
    max_segments: usize,
    gate: BroadcastGate,
}

impl<T> std::fmt::Debug for SegmentedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedStream")
            .field("segment_size", &self.segment_size)
            .field("max_segments", &self.max_segments)
            .field("last_offset", &self.last_offset())
            .finish_non_exhaustive()
    }
}

impl<T> SegmentedStream<T> {
    /// Create a stream retaining at least `capacity` items in segments of
    /// `segment_size` items.
    pub fn new(segment_size: usize, capacity: usize) -> Self {
        let segment_size = segment_size.max(1);
        let max_segments = capacity.div_ceil(segment_size).max(1);
        Self {
            segments: RwLock::new(Segments {
                queue: RingQueue::new(),
                evicted: 0,
            }),
            segment_size,
            max_segments,
            gate: BroadcastGate::new(),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.segment_size, config.capacity)
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Maximum number of segments retained at once.
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Offset of the newest item, or 0 if nothing was ever added.
    pub fn last_offset(&self) -> u64 {
        self.segments.read().last_offset(self.segment_size as u64)
    }

    /// Offset preceding the oldest retained item.
    pub fn first_offset(&self) -> u64 {
        self.segments.read().first_offset(self.segment_size as u64)
    }

    /// Append `items` and wake blocked readers.
    ///
    /// Returns the offset of the last appended item, or 0 when `items` is
    /// empty.
    pub fn add<I>(&self, items: I) -> u64
    where
        I: IntoIterator<Item = T>,
    {
        let mut added = 0usize;
        let last = {
            let mut segs = self.segments.write();
            for item in items {
                let tail_full = segs
                    .queue
                    .tail()
                    .map_or(true, |tail| tail.len() >= self.segment_size);
                if tail_full {
                    self.open_segment(&mut segs);
                }
                if let Ok(tail) = segs.queue.tail_mut() {
                    tail.push(item);
                    added += 1;
                }
            }
            segs.last_offset(self.segment_size as u64)
        };

        if added == 0 {
            return 0;
        }
        self.gate.broadcast();
        last
    }

    fn open_segment(&self, segs: &mut Segments<T>) {
        let segment = if segs.queue.len() >= self.max_segments {
            match segs.queue.remove() {
                Ok(mut oldest) => {
                    oldest.clear();
                    segs.evicted += 1;
                    oldest
                }
                Err(_) => Vec::with_capacity(self.segment_size),
            }
        } else {
            Vec::with_capacity(self.segment_size)
        };
        segs.queue.add(segment);
    }
}

impl<T: Clone> SegmentedStream<T> {
    /// Items after `offset` that are available right now.
    ///
    /// Returns at most the remainder of one segment, together with the
    /// offset to pass on the next call. An `offset` at or past the end
    /// yields no items and the current last offset.
    pub fn read_non_blocking(&self, offset: u64) -> (Vec<T>, u64) {
        let segs = self.segments.read();
        self.read_at(&segs, offset)
    }

    /// Subscribe-from-now: no items, plus the current last offset.
    pub fn read_from_end(&self) -> (Vec<T>, u64) {
        (Vec::new(), self.last_offset())
    }

    /// Everything after `offset` that is available right now.
    pub fn read_all_non_blocking(&self, offset: u64) -> (Vec<T>, u64) {
        let segs = self.segments.read();
        let mut out = Vec::new();
        let mut offset = offset;
        loop {
            let (items, next) = self.read_at(&segs, offset);
            if items.is_empty() {
                return (out, next);
            }
            out.extend(items);
            offset = next;
        }
    }

    /// Wait until items after `offset` exist, then return them.
    ///
    /// Returns `([], 0)` if `cancel` fires first.
    pub async fn read_blocking(&self, cancel: &CancellationToken, offset: u64) -> (Vec<T>, u64) {
        loop {
            let listener = {
                let segs = self.segments.read();
                let (items, next) = self.read_at(&segs, offset);
                if !items.is_empty() {
                    return (items, next);
                }
                // Taken under the read lock: an `add` cannot slip in between
                // the empty read and the registration.
                self.gate.listen()
            };
            if !listener.wait(cancel).await {
                return (Vec::new(), 0);
            }
        }
    }

    /// Deliver every batch appended from now on to `callback` until it fails
    /// or `cancel` fires.
    pub async fn subscribe<F, Fut, E>(&self, cancel: &CancellationToken, callback: F) -> Result<(), E>
    where
        F: FnMut(Vec<T>, u64) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let (_, offset) = self.read_from_end();
        self.subscribe_from(cancel, offset, callback).await
    }

    /// Like [`Self::subscribe`], resuming after `offset`.
    pub async fn subscribe_from<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        offset: u64,
        mut callback: F,
    ) -> Result<(), E>
    where
        F: FnMut(Vec<T>, u64) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut offset = offset;
        loop {
            let (items, next) = self.read_blocking(cancel, offset).await;
            if items.is_empty() {
                return Ok(());
            }
            offset = next;
            callback(items, offset).await?;
        }
    }

    fn read_at(&self, segs: &Segments<T>, offset: u64) -> (Vec<T>, u64) {
        let size = self.segment_size as u64;
        let first = segs.first_offset(size);
        let offset = if offset < first {
            debug!(requested = offset, resumed_at = first, "reader fell behind, skipping evicted items");
            first
        } else {
            offset
        };

        let segment = isize::try_from(offset / size - segs.evicted)
            .ok()
            .and_then(|idx| segs.queue.get(idx).ok());
        let Some(segment) = segment else {
            return (Vec::new(), segs.last_offset(size));
        };

        let start = (offset % size) as usize;
        if start >= segment.len() {
            return (Vec::new(), segs.last_offset(size));
        }
        let items = segment[start..].to_vec();
        let next = offset + items.len() as u64;
        (items, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn offsets_start_at_one() {
        let s = SegmentedStream::new(4, 16);
        assert_eq!(s.last_offset(), 0);
        assert_eq!(s.add([10]), 1);
        assert_eq!(s.add([11, 12]), 3);
        assert_eq!(s.add(Vec::<i32>::new()), 0);
        assert_eq!(s.last_offset(), 3);
    }

    #[test]
    fn read_all_returns_items_in_append_order() {
        let s = SegmentedStream::new(3, 100);
        for chunk in (0..20).collect::<Vec<_>>().chunks(4) {
            s.add(chunk.to_vec());
        }
        let (items, offset) = s.read_all_non_blocking(0);
        assert_eq!(items, (0..20).collect::<Vec<_>>());
        assert_eq!(offset, 20);
    }

    #[test]
    fn add_offsets_are_monotonic() {
        let s = SegmentedStream::new(5, 12);
        let mut prev = 0;
        for i in 0..50 {
            let off = s.add([i]);
            assert!(off > prev);
            prev = off;
        }
    }

    #[test]
    fn segment_scenario_without_eviction() {
        let s = SegmentedStream::new(16, 31);
        assert_eq!(s.max_segments(), 2);
        s.add(0..32);

        let (items, offset) = s.read_non_blocking(0);
        assert_eq!(items, (0..16).collect::<Vec<_>>());
        assert_eq!(offset, 16);

        let (all, offset) = s.read_all_non_blocking(0);
        assert_eq!(all.len(), 32);
        assert_eq!(all.last(), Some(&31));
        assert_eq!(offset, 32);
    }

    #[rstest]
    #[case(16, 31, 33)]
    #[case(16, 31, 100)]
    #[case(4, 10, 57)]
    #[case(1, 1, 9)]
    #[case(8, 64, 64)]
    fn capacity_is_bounded(#[case] seg: usize, #[case] cap: usize, #[case] n: usize) {
        let s = SegmentedStream::new(seg, cap);
        for i in 0..n {
            s.add([i]);
        }
        let (items, offset) = s.read_all_non_blocking(0);
        assert!(items.len() <= cap.div_ceil(seg) * seg);
        assert_eq!(items.last(), Some(&(n - 1)));
        assert_eq!(offset, n as u64);
    }

    #[test]
    fn evicted_offsets_resume_at_oldest_retained() {
        let s = SegmentedStream::new(4, 8);
        s.add(0..13);
        // max_segments = 2: [0..4) and [4..8) evicted, [8..12) [12] retained
        assert_eq!(s.first_offset(), 8);
        let (items, offset) = s.read_non_blocking(1);
        assert_eq!(items, vec![8, 9, 10, 11]);
        assert_eq!(offset, 12);
        let (items, _) = s.read_all_non_blocking(1);
        assert_eq!(items, vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn read_from_end_is_always_empty() {
        let s = SegmentedStream::new(4, 8);
        assert_eq!(s.read_from_end(), (Vec::<u8>::new(), 0));
        s.add([1u8, 2, 3, 4, 5]);
        assert_eq!(s.read_from_end(), (Vec::new(), 5));
        s.add(0..20u8);
        let (items, offset) = s.read_from_end();
        assert!(items.is_empty());
        assert_eq!(offset, 25);
    }

    #[test]
    fn read_past_end_returns_last_offset() {
        let s = SegmentedStream::new(4, 8);
        s.add([1, 2, 3]);
        assert_eq!(s.read_non_blocking(3), (Vec::new(), 3));
        assert_eq!(s.read_non_blocking(40), (Vec::new(), 3));
    }

    #[test]
    fn cursor_never_sees_an_offset_twice() {
        let s = SegmentedStream::new(3, 9);
        let mut cursor = 0;
        let mut seen = Vec::new();
        for round in 0..10 {
            s.add([round * 2, round * 2 + 1]);
            let (items, next) = s.read_all_non_blocking(cursor);
            assert!(next >= cursor);
            cursor = next;
            seen.extend(items);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_add() {
        let s = Arc::new(SegmentedStream::new(4, 16));
        let cancel = CancellationToken::new();

        let reader = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move { s.read_blocking(&cancel, 0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        s.add(["hello"]);

        let (items, offset) = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader was not woken")
            .unwrap();
        assert_eq!(items, vec!["hello"]);
        assert_eq!(offset, 1);
    }

    #[tokio::test]
    async fn cancelled_read_returns_empty() {
        let s: Arc<SegmentedStream<u32>> = Arc::new(SegmentedStream::new(4, 16));
        let cancel = CancellationToken::new();
        let reader = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move { s.read_blocking(&cancel, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, (Vec::new(), 0));
    }

    #[tokio::test]
    async fn subscribe_delivers_until_callback_fails() {
        let s = Arc::new(SegmentedStream::new(4, 64));
        s.add([100]); // before subscribing, never delivered
        let cancel = CancellationToken::new();

        let sub = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let res = s
                    .subscribe(&cancel, |items, _offset| {
                        seen.extend(items);
                        let stop = seen.len() >= 3;
                        async move {
                            if stop {
                                Err("enough")
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await;
                (res, seen)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..3 {
            s.add([i]);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (res, seen) = tokio::time::timeout(Duration::from_secs(1), sub)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err("enough"));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn subscribe_returns_ok_on_cancel() {
        let s: Arc<SegmentedStream<u8>> = Arc::new(SegmentedStream::new(4, 8));
        let cancel = CancellationToken::new();
        let sub = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                s.subscribe(&cancel, |_, _| async { Err::<(), ()>(()) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), sub).await.unwrap().unwrap();
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn concurrent_producers_and_readers_agree_on_order() {
        let s = Arc::new(SegmentedStream::new(8, 4096));
        let cancel = CancellationToken::new();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&s);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut offset = 0;
                    let mut seen = Vec::new();
                    while seen.len() < 400 {
                        let (items, next) = s.read_blocking(&cancel, offset).await;
                        if items.is_empty() {
                            break;
                        }
                        offset = next;
                        seen.extend(items);
                    }
                    seen
                })
            })
            .collect();

        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let s = Arc::clone(&s);
                tokio::spawn(async move {
                    for i in 0..100u32 {
                        s.add([p * 1000 + i]);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }

        let (expected, _) = s.read_all_non_blocking(0);
        for r in readers {
            let seen = tokio::time::timeout(Duration::from_secs(2), r)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(seen, expected);
        }
    }
}
