use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, OnceLock,
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{
    is_http_request_data,
    network::{NetworkStream, StreamReader, StreamSettings},
    ConnectionKey, Endpoint, Segment,
};
use crate::log::AggregatedLog;

/// Connection facts the dispatch loop publishes for the handler thread.
#[derive(Debug)]
pub struct ConnectionActivity {
    last_seen_micros: AtomicI64,
    peers: OnceLock<(Endpoint, Endpoint)>,
}

impl ConnectionActivity {
    fn new(ts: DateTime<Utc>) -> Self {
        ConnectionActivity {
            last_seen_micros: AtomicI64::new(ts.timestamp_micros()),
            peers: OnceLock::new(),
        }
    }

    fn touch(&self, ts: DateTime<Utc>) {
        self.last_seen_micros
            .store(ts.timestamp_micros(), Ordering::Release);
    }

    /// Capture time of the most recent packet on the connection.
    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.last_seen_micros.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    /// `(client, server)` once the connection was identified as HTTP.
    pub fn peers(&self) -> Option<&(Endpoint, Endpoint)> {
        self.peers.get()
    }
}

/// The handler's view of a connection.
pub struct ConnectionReaders {
    pub id: u64,
    pub key: ConnectionKey,
    /// Client to server bytes.
    pub up: StreamReader,
    /// Server to client bytes.
    pub down: StreamReader,
    pub activity: Arc<ConnectionActivity>,
}

pub struct TcpConnection {
    id: u64,
    key: ConnectionKey,
    up_stream: NetworkStream,
    down_stream: NetworkStream,
    client: Option<Endpoint>,
    last_timestamp: DateTime<Utc>,
    activity: Arc<ConnectionActivity>,
}

impl TcpConnection {
    pub fn new(
        id: u64,
        key: ConnectionKey,
        settings: StreamSettings,
        log: Arc<AggregatedLog>,
        ts: DateTime<Utc>,
    ) -> (TcpConnection, ConnectionReaders) {
        let (up_stream, mut up) =
            NetworkStream::new(format!("up {key}"), settings.clone(), log.clone());
        let (down_stream, mut down) = NetworkStream::new(format!("down {key}"), settings, log);

        up.set_opposite(down.queue());
        down.set_opposite(up.queue());

        let activity = Arc::new(ConnectionActivity::new(ts));

        let connection = TcpConnection {
            id,
            key: key.clone(),
            up_stream,
            down_stream,
            client: None,
            last_timestamp: ts,
            activity: activity.clone(),
        };

        let readers = ConnectionReaders {
            id,
            key,
            up,
            down,
            activity,
        };

        (connection, readers)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// The endpoint that sent the first HTTP request seen on this connection.
    pub fn client(&self) -> Option<&Endpoint> {
        self.client.as_ref()
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.last_timestamp
    }

    pub fn up_stream(&self) -> &NetworkStream {
        &self.up_stream
    }

    pub fn down_stream(&self) -> &NetworkStream {
        &self.down_stream
    }

    pub fn on_receive(
        &mut self,
        source: &Endpoint,
        dest: &Endpoint,
        segment: Segment,
        ts: DateTime<Utc>,
    ) {
        trace!(key = %self.key, ?segment, "connection receive");
        self.last_timestamp = ts;
        self.activity.touch(ts);

        if self.client.is_none() {
            if !is_http_request_data(&segment.payload) {
                trace!(key = %self.key, "skip non HTTP data");
                return;
            }
            // peers are set once, together with the client
            if self.activity.peers.set((source.clone(), dest.clone())).is_err() {
                debug!(key = %self.key, "connection peers already recorded");
            }
            self.client = Some(source.clone());
        }

        let from_client = self.client.as_ref() == Some(source);
        let (send_stream, confirm_stream) = if from_client {
            (&mut self.up_stream, &mut self.down_stream)
        } else {
            (&mut self.down_stream, &mut self.up_stream)
        };

        let flags = segment.flags;
        let ack = segment.ack;

        send_stream.append_packet(segment);

        if flags.ack {
            confirm_stream.confirm_packet(ack);
        }

        if flags.fin || flags.rst {
            send_stream.mark_closed();
        }
    }

    /// True when both directions have sent FIN or RST.
    pub fn closed(&self) -> bool {
        self.up_stream.is_closed() && self.down_stream.is_closed()
    }

    pub fn force_close(&mut self) {
        self.up_stream.mark_closed();
        self.down_stream.mark_closed();
        self.finish();
    }

    /// Hand over whatever contiguous data is still buffered, then signal end
    /// of stream to both readers.
    pub fn finish(&mut self) {
        self.up_stream.flush_pending();
        self.down_stream.flush_pending();
        self.up_stream.finish();
        self.down_stream.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TcpFlags;
    use bytes::Bytes;
    use std::io::Read;

    fn endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint::new(ip.parse().unwrap(), port)
    }

    fn segment(seq: u32, ack: Option<u32>, payload: &'static [u8]) -> Segment {
        Segment {
            seq,
            ack: ack.unwrap_or(0),
            flags: TcpFlags {
                ack: ack.is_some(),
                ..TcpFlags::default()
            },
            payload: Bytes::from_static(payload),
        }
    }

    fn connection(client: &Endpoint, server: &Endpoint) -> (TcpConnection, ConnectionReaders) {
        TcpConnection::new(
            1,
            ConnectionKey::new(client, server),
            StreamSettings::default(),
            Arc::new(AggregatedLog::new()),
            Utc::now(),
        )
    }

    #[test]
    fn client_is_first_http_sender() {
        let client = endpoint("10.0.0.2", 51000);
        let server = endpoint("10.0.0.1", 80);
        let (mut connection, readers) = connection(&client, &server);

        let stale = segment(500, Some(100), b"leftover bytes");
        connection.on_receive(&server, &client, stale, Utc::now());
        assert!(connection.client().is_none());
        assert_eq!(connection.down_stream().pending_segments(), 0);

        let request = segment(100, Some(500), b"GET / HTTP/1.1\r\n\r\n");
        connection.on_receive(&client, &server, request, Utc::now());

        assert_eq!(connection.client(), Some(&client));
        assert_eq!(readers.activity.peers(), Some(&(client.clone(), server.clone())));
        assert_eq!(connection.up_stream().pending_segments(), 1);
    }

    #[test]
    fn ack_releases_opposite_direction() {
        let client = endpoint("10.0.0.2", 51000);
        let server = endpoint("10.0.0.1", 80);
        let (mut connection, mut readers) = connection(&client, &server);

        let request = b"GET / HTTP/1.1\r\n\r\n";
        connection.on_receive(&client, &server, segment(100, Some(500), request), Utc::now());
        let ack = segment(500, Some(100 + request.len() as u32), b"");
        connection.on_receive(&server, &client, ack, Utc::now());

        assert_eq!(connection.up_stream().pending_segments(), 0);
        connection.finish();

        let mut bytes = Vec::new();
        readers.up.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, request);
    }

    #[test]
    fn closes_after_both_directions_finish() {
        let client = endpoint("10.0.0.2", 51000);
        let server = endpoint("10.0.0.1", 80);
        let (mut connection, _readers) = connection(&client, &server);

        let request = segment(100, Some(500), b"GET / HTTP/1.1\r\n\r\n");
        connection.on_receive(&client, &server, request, Utc::now());

        let mut fin = segment(118, Some(500), b"");
        fin.flags.fin = true;
        connection.on_receive(&client, &server, fin, Utc::now());
        assert!(!connection.closed());

        let mut rst = segment(500, None, b"");
        rst.flags.rst = true;
        connection.on_receive(&server, &client, rst, Utc::now());
        assert!(connection.closed());
    }
}
