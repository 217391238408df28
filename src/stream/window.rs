use std::cmp::Ordering;

use tracing::trace;

use super::Segment;

/// Distance from the 32 bit boundary inside which sequence numbers are
/// treated as having wrapped around.
pub const SEQ_WRAP_WINDOW: u32 = 0x0000_FFFF;

const INITIAL_CAPACITY: usize = 64;

/// Compare two sequence numbers. `Less` means `a` comes earlier in the
/// stream than `b`.
pub fn compare_seq(a: u32, b: u32) -> Ordering {
    compare_seq_with_window(a, b, SEQ_WRAP_WINDOW)
}

pub fn compare_seq_with_window(a: u32, b: u32, wrap_window: u32) -> Ordering {
    if a < wrap_window && b > u32::MAX - wrap_window {
        Ordering::Greater
    } else if b < wrap_window && a > u32::MAX - wrap_window {
        Ordering::Less
    } else {
        (a.wrapping_sub(b) as i32).cmp(&0)
    }
}

/// Reorder buffer for one direction of a connection.
///
/// Segments are kept sorted by sequence number in a ring that doubles when
/// full. They leave the window only through [`ReceiveWindow::confirm`], in
/// sequence order, once an acknowledgement covers them.
pub struct ReceiveWindow {
    buffer: Vec<Option<Segment>>,
    start: usize,
    size: usize,
    last_ack: Option<u32>,
    expect_begin: Option<u32>,
    wrap_window: u32,
    lost_gaps: u64,
    key: String,
}

impl ReceiveWindow {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_capacity(INITIAL_CAPACITY, SEQ_WRAP_WINDOW, key)
    }

    pub fn with_capacity(capacity: usize, wrap_window: u32, key: impl Into<String>) -> Self {
        let capacity = capacity.max(1);

        ReceiveWindow {
            buffer: (0..capacity).map(|_| None).collect(),
            start: 0,
            size: 0,
            last_ack: None,
            expect_begin: None,
            wrap_window,
            lost_gaps: 0,
            key: key.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Next sequence number to be delivered, once anything was delivered.
    pub fn expect_begin(&self) -> Option<u32> {
        self.expect_begin
    }

    pub fn last_ack(&self) -> Option<u32> {
        self.last_ack
    }

    /// Number of times delivery skipped over missing bytes.
    pub fn lost_gaps(&self) -> u64 {
        self.lost_gaps
    }

    fn compare(&self, a: u32, b: u32) -> Ordering {
        compare_seq_with_window(a, b, self.wrap_window)
    }

    fn slot(&self, logical: usize) -> usize {
        (self.start + logical) % self.buffer.len()
    }

    fn get(&self, logical: usize) -> Option<&Segment> {
        self.buffer[self.slot(logical)].as_ref()
    }

    pub fn insert(&mut self, segment: Segment) {
        if segment.payload.is_empty() {
            return;
        }

        if let Some(expect) = self.expect_begin {
            if self.compare(expect, segment.end_seq()) != Ordering::Less {
                trace!(key = %self.key, seq = segment.seq, "dropping already delivered segment");
                return;
            }
        }

        let mut idx = self.size;
        while idx > 0 {
            let prev = match self.get(idx - 1) {
                Some(prev) => prev,
                None => break,
            };

            match self.compare(prev.seq, segment.seq) {
                Ordering::Equal => {
                    trace!(key = %self.key, seq = segment.seq, "dropping duplicated segment");
                    return;
                }
                Ordering::Less => break,
                Ordering::Greater => idx -= 1,
            }
        }

        if self.size == self.buffer.len() {
            self.expand();
        }

        let mut i = self.size;
        while i > idx {
            let from = self.slot(i - 1);
            let to = self.slot(i);
            self.buffer[to] = self.buffer[from].take();
            i -= 1;
        }

        let at = self.slot(idx);
        self.buffer[at] = Some(segment);
        self.size += 1;
    }

    /// Release every buffered segment whose payload ends at or before `ack`,
    /// in order, with any already delivered prefix trimmed off.
    pub fn confirm<F>(&mut self, ack: u32, mut deliver: F)
    where
        F: FnMut(Segment),
    {
        trace!(key = %self.key, size = self.size, ack, "confirming window");

        let mut idx = 0;
        while idx < self.size {
            let slot = self.slot(idx);
            let within = match &self.buffer[slot] {
                Some(segment) => self.compare(segment.end_seq(), ack) != Ordering::Greater,
                None => true,
            };
            if !within {
                break;
            }
            idx += 1;

            let mut segment = match self.buffer[slot].take() {
                Some(segment) => segment,
                None => continue,
            };
            let new_expect = segment.end_seq();

            if let Some(expect) = self.expect_begin {
                match self.compare(expect, segment.seq) {
                    Ordering::Greater => {
                        let duplicated = expect.wrapping_sub(segment.seq) as usize;
                        if duplicated >= segment.payload.len() {
                            continue;
                        }
                        segment.payload = segment.payload.slice(duplicated..);
                        segment.seq = expect;
                    }
                    Ordering::Less => {
                        trace!(
                            key = %self.key,
                            expect,
                            seq = segment.seq,
                            "gap in stream, bytes lost"
                        );
                        self.lost_gaps += 1;
                    }
                    Ordering::Equal => {}
                }
            }

            deliver(segment);
            self.expect_begin = Some(new_expect);
        }

        self.start = self.slot(idx);
        self.size -= idx;

        match self.last_ack {
            Some(last) if self.compare(last, ack) != Ordering::Less => {}
            _ => self.last_ack = Some(ack),
        }
    }

    /// Drop all buffered segments, returning how many payload bytes were held.
    pub fn clear(&mut self) -> usize {
        let mut bytes = 0;
        for slot in self.buffer.iter_mut() {
            if let Some(segment) = slot.take() {
                bytes += segment.payload.len();
            }
        }
        self.start = 0;
        self.size = 0;
        bytes
    }

    /// End of the gapless run at the front of the window, provided the run
    /// connects to the bytes already delivered.
    pub fn contiguous_end(&self) -> Option<u32> {
        let first = self.get(0)?;
        let mut end = match self.expect_begin {
            Some(expect) if self.compare(first.seq, expect) == Ordering::Greater => return None,
            Some(expect) => expect,
            None => first.seq,
        };

        for logical in 0..self.size {
            let segment = match self.get(logical) {
                Some(segment) => segment,
                None => break,
            };
            if self.compare(segment.seq, end) == Ordering::Greater {
                break;
            }
            if self.compare(segment.end_seq(), end) == Ordering::Greater {
                end = segment.end_seq();
            }
        }

        Some(end)
    }

    fn expand(&mut self) {
        let capacity = self.buffer.len() * 2;
        let mut buffer: Vec<Option<Segment>> = Vec::with_capacity(capacity);

        for logical in 0..self.size {
            let slot = self.slot(logical);
            buffer.push(self.buffer[slot].take());
        }
        buffer.resize_with(capacity, || None);

        trace!(key = %self.key, capacity, "window expanded");
        self.start = 0;
        self.buffer = buffer;
    }
}
