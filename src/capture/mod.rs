//! Packet capture and the dispatch loop feeding the assembler.
//!
//! The dispatcher is the only producer for every stream: it decodes captured
//! frames, hands TCP segments to the [`TcpAssembler`] and runs the periodic
//! idle sweep between packets.

use std::{
    io,
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use etherparse::SlicedPacket;
use pcap::{Activated, Active, Capture, Device, Linktype, Offline, PacketHeader};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    log::AggregatedLog,
    stream::{EnrichedPacket, TcpAssembler},
};

/// Read timeout handed to libpcap so the loop regains control while idle.
pub const CAPTURE_READ_TIMEOUT_MS: i32 = 100;
const SNAPLEN: i32 = 65536;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
}

/// Open a live capture on `name` and install `filter`.
pub fn open_device(name: &str, filter: &str) -> Result<Capture<Active>, CaptureError> {
    let device = Device::list()?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))?;

    info!(device = %device.name, %filter, "opening capture device");

    let mut capture = Capture::from_device(device)?
        .promisc(true)
        .snaplen(SNAPLEN)
        .immediate_mode(true)
        .timeout(CAPTURE_READ_TIMEOUT_MS)
        .open()?;
    capture.filter(filter, true)?;

    Ok(capture)
}

/// Open a pcap file, or the pcap stream on stdin when `path` is `-`.
pub fn open_file(path: &Path, filter: &str) -> Result<Capture<Offline>, CaptureError> {
    let mut capture = if path == Path::new("-") {
        // SAFETY: stdin stays open for the lifetime of the process.
        unsafe { Capture::from_raw_fd(io::stdin().as_raw_fd())? }
    } else {
        Capture::from_file(path)?
    };
    capture.filter(filter, true)?;

    Ok(capture)
}

pub fn packet_timestamp(header: &PacketHeader) -> DateTime<Utc> {
    let micros = header.ts.tv_usec.clamp(0, 999_999) as u32;
    DateTime::from_timestamp(header.ts.tv_sec as i64, micros * 1000).unwrap_or_else(Utc::now)
}

/// Decode a captured frame of the given link type into a TCP packet.
pub fn decode_packet(linktype: Linktype, data: &[u8], ts: DateTime<Utc>) -> Option<EnrichedPacket> {
    let sliced = if linktype == Linktype::LINUX_SLL {
        SlicedPacket::from_linux_sll(data).ok()?
    } else if linktype == Linktype::RAW || linktype == Linktype::IPV4 || linktype == Linktype::IPV6
    {
        SlicedPacket::from_ip(data).ok()?
    } else {
        SlicedPacket::from_ethernet(data).ok()?
    };

    EnrichedPacket::enrich_packet(&sliced, ts)
}

/// Where "now" comes from when deciding which connections are idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Clock {
    /// Wall clock, for live capture.
    Live,
    /// Latest capture timestamp seen, for replayed files.
    Replay,
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub flush_interval: Duration,
    pub aggregated_log_interval: Duration,
    pub response_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            flush_interval: Duration::from_secs(10),
            aggregated_log_interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Dispatcher {
    assembler: TcpAssembler,
    log: Arc<AggregatedLog>,
    settings: DispatchSettings,
    clock: Clock,
    latest_capture: Option<DateTime<Utc>>,
    last_flush: Instant,
    last_log_flush: Instant,
    packets: u64,
}

impl Dispatcher {
    pub fn new(
        assembler: TcpAssembler,
        log: Arc<AggregatedLog>,
        settings: DispatchSettings,
        clock: Clock,
    ) -> Self {
        Dispatcher {
            assembler,
            log,
            settings,
            clock,
            latest_capture: None,
            last_flush: Instant::now(),
            last_log_flush: Instant::now(),
            packets: 0,
        }
    }

    pub fn assembler(&self) -> &TcpAssembler {
        &self.assembler
    }

    /// Pull packets until the source is exhausted, then shut down.
    pub fn run<T: Activated + ?Sized>(
        &mut self,
        capture: &mut Capture<T>,
    ) -> Result<(), CaptureError> {
        let linktype = capture.get_datalink();
        debug!(?linktype, "dispatch loop starting");

        loop {
            match capture.next_packet() {
                Ok(packet) => {
                    let ts = packet_timestamp(packet.header);
                    self.handle_packet(linktype, packet.data, ts);
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(pcap::Error::NoMorePackets) => break,
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            }

            self.tick();
        }

        self.shutdown();
        Ok(())
    }

    pub fn handle_packet(&mut self, linktype: Linktype, data: &[u8], ts: DateTime<Utc>) {
        self.packets += 1;
        if self.latest_capture.map_or(true, |latest| ts > latest) {
            self.latest_capture = Some(ts);
        }

        let packet = match decode_packet(linktype, data, ts) {
            Some(packet) => packet,
            None => {
                trace!("skipping non TCP packet");
                return;
            }
        };

        self.assembler
            .assemble(&packet.source, &packet.dest, packet.segment, packet.ts);
    }

    /// Run whichever periodic work is due.
    pub fn tick(&mut self) {
        if self.last_flush.elapsed() >= self.settings.flush_interval {
            self.flush();
            self.last_flush = Instant::now();
        }

        if self.last_log_flush.elapsed() >= self.settings.aggregated_log_interval {
            self.log.flush();
            self.last_log_flush = Instant::now();
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match (self.clock, self.latest_capture) {
            (Clock::Replay, Some(latest)) => latest,
            _ => Utc::now(),
        }
    }

    /// Close connections idle for longer than the response timeout.
    pub fn flush(&self) -> usize {
        let timeout = TimeDelta::from_std(self.settings.response_timeout).unwrap_or(TimeDelta::MAX);
        let cutoff = self
            .now()
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let flushed = self.assembler.flush_older_than(cutoff);
        if flushed > 0 {
            debug!(flushed, "flushed idle connections");
        }
        flushed
    }

    pub fn shutdown(&mut self) {
        self.assembler.shutdown();
        self.log.flush();
        info!(packets = self.packets, "capture finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::HttpTransaction,
        stream::assembler::AssemblerSettings,
    };
    use etherparse::PacketBuilder;
    use std::sync::Mutex;

    const CLIENT: [u8; 4] = [192, 168, 1, 20];
    const SERVER: [u8; 4] = [192, 168, 1, 1];

    fn frame(from_client: bool, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        let (src, dst, sport, dport) = if from_client {
            (CLIENT, SERVER, 40000, 8080)
        } else {
            (SERVER, CLIENT, 8080, 40000)
        };
        let builder = PacketBuilder::ethernet2([0, 1, 2, 3, 4, 5], [5, 4, 3, 2, 1, 0])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, seq, 65535)
            .ack(ack);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn dispatcher() -> (Dispatcher, Arc<Mutex<Vec<HttpTransaction>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let processor = Arc::new(move |t: HttpTransaction| sink.lock().unwrap().push(t));
        let log = Arc::new(AggregatedLog::new());
        let assembler = TcpAssembler::new(AssemblerSettings::default(), processor, log.clone());

        (
            Dispatcher::new(assembler, log, DispatchSettings::default(), Clock::Replay),
            seen,
        )
    }

    #[test]
    fn dispatches_ethernet_frames_into_transactions() {
        let (mut dispatcher, seen) = dispatcher();
        let request = b"GET /health HTTP/1.1\r\nHost: svc.local\r\n\r\n";
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let ts = Utc::now();

        dispatcher.handle_packet(Linktype::ETHERNET, &frame(true, 1, 1, request), ts);
        dispatcher.handle_packet(
            Linktype::ETHERNET,
            &frame(false, 1, 1 + request.len() as u32, response),
            ts,
        );
        dispatcher.handle_packet(
            Linktype::ETHERNET,
            &frame(true, 1 + request.len() as u32, 1 + response.len() as u32, b""),
            ts,
        );
        dispatcher.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].request.path, "http://svc.local/health");
        assert_eq!(seen[0].request.destination.ip, "192.168.1.1");
        assert_eq!(seen[0].request.destination.port, 8080);
        let response = seen[0].response.as_ref().unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.entry.data, "ok");
    }

    #[test]
    fn replay_clock_flushes_by_capture_time() {
        let (mut dispatcher, seen) = dispatcher();
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        dispatcher.handle_packet(
            Linktype::ETHERNET,
            &frame(true, 1, 1, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"),
            start,
        );
        assert_eq!(dispatcher.flush(), 0);

        // a later unrelated frame moves the replay clock forward
        dispatcher.handle_packet(Linktype::ETHERNET, &[0u8; 10], start + TimeDelta::seconds(120));
        assert_eq!(dispatcher.now(), start + TimeDelta::seconds(120));
        assert_eq!(dispatcher.flush(), 1);
        assert_eq!(dispatcher.assembler().connection_count(), 0);

        dispatcher.shutdown();

        // the request was never acknowledged but is still reported
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].request.path, "http://a/");
        assert!(seen[0].response.is_none());
    }

    #[test]
    fn decodes_raw_ip_frames() {
        let builder = PacketBuilder::ipv4(CLIENT, SERVER, 64).tcp(40000, 8080, 9, 1024);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"POST /x HTTP/1.1\r\n").unwrap();

        let packet = decode_packet(Linktype::RAW, &raw, Utc::now()).unwrap();
        assert_eq!(packet.dest.port, 8080);
        assert_eq!(packet.segment.seq, 9);
    }
}
