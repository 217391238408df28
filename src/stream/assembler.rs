use std::{
    collections::HashMap,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::{
    connection::{ConnectionReaders, TcpConnection},
    is_http_request_data,
    network::StreamSettings,
    ConnectionKey, Endpoint, Segment,
};
use crate::{
    http::{HttpTrafficHandler, TransactionProcessor},
    log::AggregatedLog,
};

#[derive(Clone, Debug)]
pub struct AssemblerSettings {
    pub stream: StreamSettings,
    /// Error text in handler warnings is cut to this many characters.
    pub limited_error_length: usize,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        AssemblerSettings {
            stream: StreamSettings::default(),
            limited_error_length: 50,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Splits captured packets into connections and feeds them.
///
/// Every connection gets an [`HttpTrafficHandler`] thread when it is created.
/// The table lock is only held to look up, insert or remove entries.
pub struct TcpAssembler {
    connections: Mutex<HashMap<ConnectionKey, Arc<Mutex<TcpConnection>>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    settings: AssemblerSettings,
    processor: Arc<dyn TransactionProcessor>,
    log: Arc<AggregatedLog>,
}

impl TcpAssembler {
    pub fn new(
        settings: AssemblerSettings,
        processor: Arc<dyn TransactionProcessor>,
        log: Arc<AggregatedLog>,
    ) -> Self {
        TcpAssembler {
            connections: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            settings,
            processor,
            log,
        }
    }

    pub fn assemble(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
        segment: Segment,
        ts: DateTime<Utc>,
    ) {
        let key = ConnectionKey::new(source, dest);
        let create =
            (segment.flags.syn && !segment.flags.ack) || is_http_request_data(&segment.payload);

        let connection = match self.retrieve_connection(&key, create, ts) {
            Some(connection) => connection,
            None => {
                trace!(%key, "connection not located");
                return;
            }
        };

        let closed = {
            let mut connection = lock(&connection);
            connection.on_receive(source, dest, segment, ts);
            connection.closed()
        };

        if closed {
            debug!(%key, "connection closed");
            self.delete_connection(&key);
            lock(&connection).finish();
        }
    }

    fn retrieve_connection(
        &self,
        key: &ConnectionKey,
        create: bool,
        ts: DateTime<Utc>,
    ) -> Option<Arc<Mutex<TcpConnection>>> {
        let (connection, readers) = {
            let mut connections = lock(&self.connections);
            if let Some(connection) = connections.get(key) {
                return Some(connection.clone());
            }
            if !create {
                return None;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (connection, readers) = TcpConnection::new(
                id,
                key.clone(),
                self.settings.stream.clone(),
                self.log.clone(),
                ts,
            );
            let connection = Arc::new(Mutex::new(connection));
            connections.insert(key.clone(), connection.clone());
            (connection, readers)
        };

        debug!(%key, id = readers.id, "creating connection");
        self.start_handler(readers);

        Some(connection)
    }

    fn start_handler(&self, readers: ConnectionReaders) {
        let key = readers.key.clone();
        match HttpTrafficHandler::spawn(
            readers,
            self.processor.clone(),
            self.settings.limited_error_length,
        ) {
            Ok(handle) => lock(&self.handlers).push(handle),
            Err(e) => warn!(%key, error = %e, "failed to start http traffic handler"),
        }
    }

    fn delete_connection(&self, key: &ConnectionKey) {
        lock(&self.connections).remove(key);
    }

    /// Force close every connection whose last packet is older than `cutoff`.
    /// Returns how many were closed.
    pub fn flush_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<Arc<Mutex<TcpConnection>>> = {
            let mut connections = lock(&self.connections);
            let keys: Vec<ConnectionKey> = connections
                .iter()
                .filter(|(_, connection)| lock(connection).last_timestamp() < cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| connections.remove(key)).collect()
        };

        for connection in &stale {
            let mut connection = lock(connection);
            debug!(key = %connection.key(), "flushing idle connection");
            connection.force_close();
        }

        self.reap_handlers();
        stale.len()
    }

    fn reap_handlers(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut handlers = lock(&self.handlers);
            let (finished, running): (Vec<_>, Vec<_>) = mem::take(&mut *handlers)
                .into_iter()
                .partition(|handle| handle.is_finished());
            *handlers = running;
            finished
        };

        for handle in finished {
            if handle.join().is_err() {
                warn!("http traffic handler panicked");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Force close all live connections and wait for every handler to
    /// report what it has buffered.
    pub fn shutdown(&self) {
        let connections: Vec<Arc<Mutex<TcpConnection>>> = lock(&self.connections)
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        for connection in &connections {
            lock(connection).force_close();
        }

        let handlers = mem::take(&mut *lock(&self.handlers));
        debug!(
            connections = connections.len(),
            handlers = handlers.len(),
            "assembler shutting down"
        );

        for handle in handlers {
            if handle.join().is_err() {
                warn!("http traffic handler panicked");
            }
        }
    }
}
