//! Write-behind cache between the download socket and the disk.
//!
//! Network reads are appended immediately; the disk sink gets at most one
//! buffer at a time and reports back when it wants the next. Small reads are
//! coalesced into packets of up to [`MAX_PACKET_SIZE`] so the sink is not
//! handed every 1 KiB read separately.
//!
//! While the cache is open it runs in *async* mode: a sink that becomes ready
//! just raises a flag and the next [`WriteCacheHandler::write`] hands it a
//! packet. [`WriteCacheHandler::close`] switches to *sync* mode, where every
//! readiness report immediately pulls the next packet until the queue is
//! empty, and then asks the sink to finish.

use std::collections::VecDeque;

/// Largest packet handed to the sink in one go.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// An asynchronous byte sink that accepts one buffer at a time.
pub trait WriteSink {
    /// Starts writing `data`. Completion is reported out of band.
    fn send(&mut self, data: Vec<u8>);
    /// Flushes and closes. Completion is reported out of band.
    fn finish(&mut self);
}

/// Outcome of feeding a sink report into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Nothing to report
    Pending,
    /// Every byte has reached the sink and it has closed
    Done,
    /// The sink failed; the cache has let go of it
    Error(String),
}

/// Write-behind buffer in front of a [`WriteSink`].
#[derive(Debug)]
pub struct WriteCacheHandler<S: WriteSink> {
    sink: Option<S>,
    cache: VecDeque<Vec<u8>>,
    write_ready: bool,
    async_mode: bool,
    finishing: bool,
}

impl<S: WriteSink> WriteCacheHandler<S> {
    /// Wraps a sink that is open and idle.
    pub const fn new(sink: S) -> Self {
        Self {
            sink: Some(sink),
            cache: VecDeque::new(),
            write_ready: true,
            async_mode: true,
            finishing: false,
        }
    }

    /// Queues bytes, opening a new packet when the tail would overflow.
    pub fn append(&mut self, data: &[u8]) {
        match self.cache.back_mut() {
            Some(tail) if tail.len() + data.len() <= MAX_PACKET_SIZE => tail.extend_from_slice(data),
            _ => self.cache.push_back(data.to_vec()),
        }
    }

    /// Hands the head packet to the sink if it is idle and either `force` is
    /// set or at least two packets are waiting. Returns whether it did.
    pub fn write(&mut self, force: bool) -> bool {
        if self.cache.is_empty() || !self.write_ready || !self.async_mode {
            return false;
        }
        if !force && self.cache.len() < 2 {
            return false;
        }
        let (Some(sink), Some(packet)) = (self.sink.as_mut(), self.cache.pop_front()) else {
            return false;
        };
        self.write_ready = false;
        sink.send(packet);
        true
    }

    /// Flushes once and drains everything that is left, then finishes the
    /// sink. [`CacheEvent::Done`] follows once the sink reports it flushed.
    pub fn close(&mut self) {
        self.write(true);
        self.async_mode = false;
        if self.write_ready {
            self.drain_next();
        }
    }

    /// Hands every queued packet to the sink and lets go of it without
    /// waiting for completion.
    ///
    /// The sink processes what it was given in order before it stops, so
    /// bytes already received are not lost; the one-outstanding-buffer rule
    /// no longer matters once nobody listens for the results.
    pub fn close_now(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            while let Some(packet) = self.cache.pop_front() {
                sink.send(packet);
            }
            sink.finish();
        }
        self.cache.clear();
        self.write_ready = false;
    }

    /// The sink finished the last packet it was given.
    pub fn on_sink_ready(&mut self) -> CacheEvent {
        if self.sink.is_none() {
            return CacheEvent::Pending;
        }
        if self.async_mode {
            self.write_ready = true;
        } else {
            self.drain_next();
        }
        CacheEvent::Pending
    }

    /// The sink flushed and closed.
    pub fn on_sink_flushed(&mut self) -> CacheEvent {
        if self.finishing && self.sink.take().is_some() {
            CacheEvent::Done
        } else {
            CacheEvent::Pending
        }
    }

    /// The sink failed.
    pub fn on_sink_error(&mut self, message: String) -> CacheEvent {
        if self.sink.take().is_none() {
            return CacheEvent::Pending;
        }
        self.cache.clear();
        self.write_ready = false;
        CacheEvent::Error(message)
    }

    /// Packets waiting for the sink.
    pub fn queued_packets(&self) -> usize {
        self.cache.len()
    }

    /// Bytes waiting for the sink.
    pub fn queued_bytes(&self) -> usize {
        self.cache.iter().map(Vec::len).sum()
    }

    /// Whether the sink is still attached.
    pub const fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    fn drain_next(&mut self) {
        if self.finishing {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        self.write_ready = false;
        match self.cache.pop_front() {
            Some(packet) => sink.send(packet),
            None => {
                self.finishing = true;
                sink.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    struct Record {
        written: Vec<Vec<u8>>,
        outstanding: usize,
        max_outstanding: usize,
        finished: usize,
    }

    #[derive(Debug, Clone, Default)]
    struct MockSink(Rc<RefCell<Record>>);

    impl MockSink {
        fn complete_one(&self) {
            let mut r = self.0.borrow_mut();
            r.outstanding -= 1;
        }
    }

    impl WriteSink for MockSink {
        fn send(&mut self, data: Vec<u8>) {
            let mut r = self.0.borrow_mut();
            r.written.push(data);
            r.outstanding += 1;
            r.max_outstanding = r.max_outstanding.max(r.outstanding);
        }

        fn finish(&mut self) {
            self.0.borrow_mut().finished += 1;
        }
    }

    #[test]
    fn test_append_coalesces_into_packets() {
        let mut cache = WriteCacheHandler::new(MockSink::default());
        cache.append(&[1; 1000]);
        cache.append(&[2; 1000]);
        assert_eq!(cache.queued_packets(), 1);

        cache.append(&vec![3; MAX_PACKET_SIZE]);
        assert_eq!(cache.queued_packets(), 2);
        assert_eq!(cache.queued_bytes(), 2000 + MAX_PACKET_SIZE);
    }

    #[test]
    fn test_write_batches_small_reads() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        cache.append(b"abc");

        assert!(!cache.write(false), "one packet is not enough without force");
        assert!(cache.write(true));
        assert_eq!(sink.0.borrow().written, vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_single_outstanding_buffer() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        for _ in 0..4 {
            cache.append(&vec![0; MAX_PACKET_SIZE]);
        }

        assert!(cache.write(false));
        assert!(!cache.write(false), "sink is busy");
        assert!(!cache.write(true), "force does not bypass a busy sink");

        sink.complete_one();
        assert_eq!(cache.on_sink_ready(), CacheEvent::Pending);
        assert!(cache.write(false));
        assert_eq!(sink.0.borrow().max_outstanding, 1);
    }

    #[test]
    fn test_close_drains_and_fires_done_once() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        for i in 0..3u8 {
            cache.append(&vec![i; MAX_PACKET_SIZE]);
        }

        cache.close();
        let mut done = 0;
        loop {
            let pending = sink.0.borrow().outstanding;
            if pending == 0 {
                break;
            }
            sink.complete_one();
            if cache.on_sink_ready() == CacheEvent::Done {
                done += 1;
            }
        }
        assert_eq!(sink.0.borrow().written.len(), 3);
        assert_eq!(sink.0.borrow().finished, 1);
        assert_eq!(sink.0.borrow().max_outstanding, 1);

        assert_eq!(cache.on_sink_flushed(), CacheEvent::Done);
        done += 1;
        assert_eq!(cache.on_sink_flushed(), CacheEvent::Pending);
        assert_eq!(done, 1);
        assert!(!cache.is_open());
    }

    #[test]
    fn test_close_on_idle_empty_cache_finishes() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        cache.close();
        assert_eq!(sink.0.borrow().finished, 1);
        assert_eq!(cache.on_sink_flushed(), CacheEvent::Done);
    }

    #[test]
    fn test_close_now_hands_over_everything() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        cache.append(b"one");
        cache.write(true);
        cache.append(b"two");

        cache.close_now();
        assert_eq!(
            sink.0.borrow().written,
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert!(!cache.is_open());
        assert_eq!(cache.on_sink_flushed(), CacheEvent::Pending);
    }

    #[test]
    fn test_error_abandons_sink() {
        let sink = MockSink::default();
        let mut cache = WriteCacheHandler::new(sink.clone());
        cache.append(b"data");
        cache.write(true);

        assert_eq!(
            cache.on_sink_error("disk full".to_string()),
            CacheEvent::Error("disk full".to_string())
        );
        assert_eq!(
            cache.on_sink_error("again".to_string()),
            CacheEvent::Pending
        );
        cache.append(b"more");
        assert!(!cache.write(true));
    }
}
