use std::{
    cmp,
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, trace};

use super::{window::ReceiveWindow, Segment};
use crate::log::AggregatedLog;

pub const CHANNEL_FULL_ABANDON: &str = "channel full, abandon data";
pub const STUCK_STREAM_EOF: &str = "detected stuck stream, simulating EOF";
pub const IDLE_STREAM_EOF: &str = "simulating EOF on a non active connection";

/// Timing and sizing knobs shared by every stream.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Capacity of the per direction delivery queue, in segments.
    pub channel_size: usize,
    /// How long a single wait for the next segment lasts.
    pub read_timeout: Duration,
    pub full_channel_check_interval: Duration,
    /// How long a full queue is tolerated before the stream is abandoned.
    pub full_channel_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            channel_size: 1024,
            read_timeout: Duration::from_secs(5),
            full_channel_check_interval: Duration::from_millis(20),
            full_channel_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// State visible to both halves of a stream.
#[derive(Debug, Default)]
struct StreamFlags {
    ignore: AtomicBool,
    eof_simulated: AtomicBool,
    dropped_segments: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl StreamFlags {
    fn is_ignoring(&self) -> bool {
        self.ignore.load(Ordering::Acquire)
    }

    fn is_eof_simulated(&self) -> bool {
        self.eof_simulated.load(Ordering::Acquire)
    }

    fn stopped(&self) -> bool {
        self.is_ignoring() || self.is_eof_simulated()
    }

    fn record_drop(&self, bytes: usize) {
        self.dropped_segments.fetch_add(1, Ordering::Relaxed);
        self.dropped_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Sending side of the delivery queue.
struct Outlet {
    key: String,
    tx: Option<Sender<Segment>>,
    flags: Arc<StreamFlags>,
    settings: StreamSettings,
    log: Arc<AggregatedLog>,
}

impl Outlet {
    fn wait_for_channel_space(&self) -> bool {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return false,
        };

        let started = Instant::now();
        while tx.len() >= self.settings.channel_size {
            if self.flags.stopped() {
                return false;
            }
            if started.elapsed() > self.settings.full_channel_timeout {
                self.log.warn(CHANNEL_FULL_ABANDON);
                self.flags.ignore.store(true, Ordering::Release);
                return false;
            }
            trace!(key = %self.key, "channel is full, waiting before write");
            thread::sleep(self.settings.full_channel_check_interval);
        }

        true
    }

    fn push(&mut self, segment: Segment) {
        if self.flags.stopped() || !self.wait_for_channel_space() {
            self.flags.record_drop(segment.payload.len());
            return;
        }

        let tx = match &self.tx {
            Some(tx) => tx,
            None => return,
        };

        match tx.try_send(segment) {
            Ok(()) => {}
            Err(TrySendError::Full(segment)) => self.flags.record_drop(segment.payload.len()),
            Err(TrySendError::Disconnected(segment)) => {
                trace!(key = %self.key, "reader is gone, ignoring stream");
                self.flags.ignore.store(true, Ordering::Release);
                self.flags.record_drop(segment.payload.len());
            }
        }
    }
}

/// Producer half of one direction: the receive window plus the queue
/// feeding the [`StreamReader`]. Driven only by the dispatch loop.
pub struct NetworkStream {
    window: ReceiveWindow,
    outlet: Outlet,
    closed: bool,
}

impl NetworkStream {
    pub fn new(
        key: impl Into<String>,
        settings: StreamSettings,
        log: Arc<AggregatedLog>,
    ) -> (NetworkStream, StreamReader) {
        let key = key.into();
        let (tx, rx) = channel::bounded(settings.channel_size.max(1));
        let flags = Arc::new(StreamFlags::default());

        let reader = StreamReader {
            key: key.clone(),
            rx,
            opposite: None,
            remain: Bytes::new(),
            flags: flags.clone(),
            settings: settings.clone(),
            log: log.clone(),
        };

        let stream = NetworkStream {
            window: ReceiveWindow::new(key.clone()),
            outlet: Outlet {
                key,
                tx: Some(tx),
                flags,
                settings,
                log,
            },
            closed: false,
        };

        (stream, reader)
    }

    pub fn key(&self) -> &str {
        &self.outlet.key
    }

    pub fn append_packet(&mut self, segment: Segment) {
        if self.outlet.flags.stopped() {
            if !segment.payload.is_empty() {
                self.outlet.flags.record_drop(segment.payload.len());
            }
            return;
        }
        self.window.insert(segment);
    }

    pub fn confirm_packet(&mut self, ack: u32) {
        if self.outlet.flags.stopped() {
            return;
        }

        if self.outlet.wait_for_channel_space() {
            let outlet = &mut self.outlet;
            self.window.confirm(ack, |segment| outlet.push(segment));
        }

        if self.outlet.flags.stopped() && !self.window.is_empty() {
            let pending = self.window.len();
            let bytes = self.window.clear();
            self.outlet
                .flags
                .dropped_segments
                .fetch_add(pending as u64, Ordering::Relaxed);
            self.outlet
                .flags
                .dropped_bytes
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// Deliver buffered data that connects to what the reader already has,
    /// whether or not it was acknowledged.
    pub fn flush_pending(&mut self) {
        if let Some(end) = self.window.contiguous_end() {
            trace!(key = %self.outlet.key, end, "delivering unacknowledged data");
            self.confirm_packet(end);
        }
    }

    /// Close the delivery queue. The reader drains what is queued and then
    /// sees end of stream.
    pub fn finish(&mut self) {
        if self.outlet.tx.take().is_some() {
            debug!(
                key = %self.outlet.key,
                dropped_segments = self.dropped_segments(),
                dropped_bytes = self.dropped_bytes(),
                lost_gaps = self.window.lost_gaps(),
                "stream finished"
            );
        }
        self.window.clear();
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// True once FIN or RST was seen from this direction's sender.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_ignoring(&self) -> bool {
        self.outlet.flags.is_ignoring()
    }

    pub fn is_eof_simulated(&self) -> bool {
        self.outlet.flags.is_eof_simulated()
    }

    /// Segments buffered in the window, not yet confirmed.
    pub fn pending_segments(&self) -> usize {
        self.window.len()
    }

    /// Segments waiting in the delivery queue for the reader.
    pub fn queued_segments(&self) -> usize {
        self.outlet.tx.as_ref().map_or(0, |tx| tx.len())
    }

    pub fn dropped_segments(&self) -> u64 {
        self.outlet.flags.dropped_segments.load(Ordering::Relaxed)
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.outlet.flags.dropped_bytes.load(Ordering::Relaxed)
    }
}

/// Consumer half of one direction, read by the HTTP handler as a blocking
/// byte source.
pub struct StreamReader {
    key: String,
    rx: Receiver<Segment>,
    opposite: Option<Receiver<Segment>>,
    remain: Bytes,
    flags: Arc<StreamFlags>,
    settings: StreamSettings,
    log: Arc<AggregatedLog>,
}

impl StreamReader {
    /// Handle on this direction's queue, used by the opposite reader to
    /// detect a stuck exchange.
    pub fn queue(&self) -> Receiver<Segment> {
        self.rx.clone()
    }

    pub fn set_opposite(&mut self, opposite: Receiver<Segment>) {
        self.opposite = Some(opposite);
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_eof_simulated(&self) -> bool {
        self.flags.is_eof_simulated()
    }

    /// Stop accepting data for this direction. Idempotent.
    pub fn close(&mut self) {
        self.flags.ignore.store(true, Ordering::Release);
    }

    fn simulate_eof(&self) {
        self.flags.eof_simulated.store(true, Ordering::Release);
    }

    fn wait_for_data(&mut self) -> bool {
        let mut last_active = Instant::now();

        loop {
            if self.flags.stopped() {
                return false;
            }

            match self.rx.recv_timeout(self.settings.read_timeout) {
                Ok(segment) => {
                    last_active = Instant::now();
                    if !segment.payload.is_empty() {
                        self.remain = segment.payload;
                        return true;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    trace!(key = %self.key, "read EOF");
                    self.simulate_eof();
                    return false;
                }
                Err(RecvTimeoutError::Timeout) => {
                    let opposite_full = self
                        .opposite
                        .as_ref()
                        .is_some_and(|opposite| opposite.len() >= self.settings.channel_size);
                    if opposite_full {
                        self.log.warn(STUCK_STREAM_EOF);
                        self.simulate_eof();
                        return false;
                    }

                    let idle = last_active.elapsed();
                    if idle > self.settings.response_timeout {
                        trace!(key = %self.key, ?idle, "non active connection");
                        self.log.warn(IDLE_STREAM_EOF);
                        self.simulate_eof();
                        return false;
                    }
                }
            }
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.remain.is_empty() && !self.wait_for_data() {
            return Ok(0);
        }

        let n = cmp::min(buf.len(), self.remain.len());
        buf[..n].copy_from_slice(&self.remain[..n]);
        self.remain.advance(n);

        trace!(key = %self.key, n, "read returned bytes");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TcpFlags;

    fn segment(seq: u32, payload: &'static [u8]) -> Segment {
        Segment {
            seq,
            ack: 0,
            flags: TcpFlags::default(),
            payload: Bytes::from_static(payload),
        }
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            channel_size: 8,
            read_timeout: Duration::from_millis(10),
            full_channel_check_interval: Duration::from_millis(5),
            full_channel_timeout: Duration::from_millis(50),
            response_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn reader_sees_confirmed_bytes_then_eof() {
        let log = Arc::new(AggregatedLog::new());
        let (mut stream, mut reader) = NetworkStream::new("up", fast_settings(), log);

        stream.append_packet(segment(6, b"world"));
        stream.append_packet(segment(0, b"hello "));
        stream.confirm_packet(11);
        stream.finish();

        let mut first = [0u8; 4];
        assert_eq!(reader.read(&mut first).unwrap(), 4);
        assert_eq!(&first, b"hell");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "o world");
        assert!(reader.is_eof_simulated());
    }

    #[test]
    fn unconfirmed_bytes_are_not_delivered() {
        let log = Arc::new(AggregatedLog::new());
        let (mut stream, _reader) = NetworkStream::new("up", fast_settings(), log);

        stream.append_packet(segment(0, b"abc"));
        stream.append_packet(segment(3, b"def"));
        stream.confirm_packet(3);

        assert_eq!(stream.queued_segments(), 1);
        assert_eq!(stream.pending_segments(), 1);
    }

    #[test]
    fn flush_pending_delivers_unacknowledged_bytes() {
        let log = Arc::new(AggregatedLog::new());
        let (mut stream, mut reader) = NetworkStream::new("up", fast_settings(), log);

        stream.append_packet(segment(0, b"GET / "));
        stream.append_packet(segment(6, b"HTTP/1.1"));
        stream.append_packet(segment(20, b"after a gap"));
        stream.flush_pending();
        assert_eq!(stream.pending_segments(), 1);
        stream.finish();

        let mut bytes = String::new();
        reader.read_to_string(&mut bytes).unwrap();
        assert_eq!(bytes, "GET / HTTP/1.1");
    }

    #[test]
    fn closed_reader_ends_wait_for_space() {
        let log = Arc::new(AggregatedLog::new());
        let settings = StreamSettings {
            channel_size: 1,
            full_channel_timeout: Duration::from_secs(5),
            ..fast_settings()
        };
        let (mut stream, mut reader) = NetworkStream::new("down", settings, log.clone());

        stream.append_packet(segment(0, b"a"));
        stream.confirm_packet(1);
        assert_eq!(stream.queued_segments(), 1);

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            reader.close();
            reader
        });

        let started = Instant::now();
        stream.append_packet(segment(1, b"b"));
        stream.confirm_packet(2);
        let _reader = closer.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(log.count(CHANNEL_FULL_ABANDON), 0);
        assert!(stream.is_ignoring());
    }

    #[test]
    fn full_queue_is_abandoned() {
        let log = Arc::new(AggregatedLog::new());
        let settings = StreamSettings {
            channel_size: 2,
            ..fast_settings()
        };
        let (mut stream, _reader) = NetworkStream::new("up", settings, log.clone());

        for (seq, byte) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            stream.append_packet(segment(seq as u32, *byte));
        }
        stream.confirm_packet(4);

        assert!(stream.is_ignoring());
        assert_eq!(stream.queued_segments(), 2);
        assert_eq!(stream.dropped_segments(), 2);
        assert_eq!(log.count(CHANNEL_FULL_ABANDON), 1);

        stream.append_packet(segment(4, b"e"));
        stream.confirm_packet(5);
        assert_eq!(stream.pending_segments(), 0);
        assert_eq!(stream.queued_segments(), 2);
        assert_eq!(stream.dropped_segments(), 3);
    }

    #[test]
    fn stuck_peer_simulates_eof() {
        let log = Arc::new(AggregatedLog::new());
        let settings = StreamSettings {
            channel_size: 1,
            ..fast_settings()
        };
        let (mut up, mut up_reader) = NetworkStream::new("up", settings.clone(), log.clone());
        let (mut down, down_reader) = NetworkStream::new("down", settings, log.clone());
        up_reader.set_opposite(down_reader.queue());

        down.append_packet(segment(0, b"x"));
        down.confirm_packet(1);
        assert_eq!(down.queued_segments(), 1);

        let mut buf = [0u8; 16];
        assert_eq!(up_reader.read(&mut buf).unwrap(), 0);
        assert!(up_reader.is_eof_simulated());
        assert_eq!(log.count(STUCK_STREAM_EOF), 1);

        up.append_packet(segment(0, b"late"));
        assert_eq!(up.pending_segments(), 0);
    }

    #[test]
    fn idle_stream_simulates_eof() {
        let log = Arc::new(AggregatedLog::new());
        let settings = StreamSettings {
            response_timeout: Duration::from_millis(40),
            ..fast_settings()
        };
        let (_stream, mut reader) = NetworkStream::new("down", settings, log.clone());

        let started = Instant::now();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(log.count(IDLE_STREAM_EOF), 1);
    }

    #[test]
    fn close_is_idempotent_and_stops_buffering() {
        let log = Arc::new(AggregatedLog::new());
        let (mut stream, mut reader) = NetworkStream::new("up", fast_settings(), log);

        reader.close();
        reader.close();

        stream.append_packet(segment(0, b"abc"));
        assert!(stream.is_ignoring());
        assert_eq!(stream.pending_segments(), 0);
        assert_eq!(stream.dropped_bytes(), 3);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
