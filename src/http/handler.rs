use std::{
    io::{self, BufRead, BufReader},
    sync::Arc,
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::{
    parse_request_head, parse_response, read_request_body, Destination, HttpError,
    HttpTransaction, Req, Resp, TransactionProcessor,
};
use crate::stream::{
    connection::{ConnectionActivity, ConnectionReaders},
    ConnectionKey, StreamReader,
};

/// Why a handler stopped reading its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopEnd {
    Eof,
    /// The connection switched protocols, e.g. to WebSocket.
    Upgraded,
    Failed,
}

/// Reads request/response pairs off one connection and reports them.
pub struct HttpTrafficHandler {
    id: u64,
    key: ConnectionKey,
    activity: Arc<ConnectionActivity>,
    processor: Arc<dyn TransactionProcessor>,
    limited_error_length: usize,
}

impl HttpTrafficHandler {
    /// Start a handler thread for the connection behind `readers`.
    pub fn spawn(
        readers: ConnectionReaders,
        processor: Arc<dyn TransactionProcessor>,
        limited_error_length: usize,
    ) -> io::Result<JoinHandle<()>> {
        let ConnectionReaders {
            id,
            key,
            up,
            down,
            activity,
        } = readers;

        let handler = HttpTrafficHandler {
            id,
            key,
            activity,
            processor,
            limited_error_length,
        };

        thread::Builder::new()
            .name(format!("http-{id}"))
            .spawn(move || handler.handle(up, down))
    }

    pub fn handle(&self, mut up: StreamReader, mut down: StreamReader) {
        debug!(key = %self.key, "http traffic handler starting");

        let end = {
            let mut requests = BufReader::new(&mut up);
            let mut responses = BufReader::new(&mut down);
            self.handle_loop(&mut requests, &mut responses)
        };

        up.close();
        down.close();
        debug!(key = %self.key, ?end, "http traffic handler done");
    }

    fn handle_loop<R, S>(&self, requests: &mut R, responses: &mut S) -> LoopEnd
    where
        R: BufRead,
        S: BufRead,
    {
        loop {
            trace!(key = %self.key, "waiting for request");

            let mut req = match parse_request_head(requests) {
                Ok(req) => req,
                Err(HttpError::Eof) => return LoopEnd::Eof,
                Err(e) => return self.fail(&e, "parsing HTTP request failed"),
            };
            let request_time = self.activity.last_seen();
            let expect_continue = req.expects_continue();

            // with Expect: 100-continue the body only follows an interim 100
            if !expect_continue {
                match read_request_body(requests, &req.headers) {
                    Ok(body) => req.body = body,
                    Err(e) => {
                        self.report(req, request_time, None);
                        return self.fail(&e, "reading HTTP request body failed");
                    }
                }
            }

            trace!(key = %self.key, method = %req.method, "reading response");
            let resp = match parse_response(responses, &req.method) {
                Ok(resp) => resp,
                Err(e) => {
                    self.report(req, request_time, None);
                    return self.fail(&e, "parsing HTTP response failed");
                }
            };

            if expect_continue && resp.code != 100 {
                trace!(key = %self.key, code = resp.code, "final response without continue");
                let headers = req.headers.clone();
                let response_time = self.activity.last_seen();
                self.report(req, request_time, Some((resp, response_time)));

                // the client may still send the body, or give up on it
                if let Err(e) = read_request_body(requests, &headers) {
                    debug!(
                        key = %self.key,
                        error = %self.limited_error(&e),
                        "request body never sent"
                    );
                    return if e.is_eof() { LoopEnd::Eof } else { LoopEnd::Failed };
                }
                continue;
            }

            let resp = if expect_continue {
                trace!(key = %self.key, "expect continue, reading final response");
                match read_request_body(requests, &req.headers) {
                    Ok(body) => req.body = body,
                    Err(e) => {
                        self.report(req, request_time, None);
                        return self.fail(&e, "reading HTTP request body failed");
                    }
                }
                match parse_response(responses, &req.method) {
                    Ok(resp) => resp,
                    Err(e) => {
                        self.report(req, request_time, None);
                        return self.fail(&e, "parsing HTTP continue response failed");
                    }
                }
            } else {
                resp
            };

            let switched = resp.code == 101;
            let websocket = req.is_websocket_upgrade();
            let response_time = self.activity.last_seen();
            self.report(req, request_time, Some((resp, response_time)));

            if switched {
                debug!(key = %self.key, websocket, "protocol switched, no longer parsing HTTP");
                return LoopEnd::Upgraded;
            }
        }
    }

    /// Log `e` unless it is a plain end of stream and pick the loop outcome.
    fn fail(&self, e: &HttpError, message: &str) -> LoopEnd {
        if e.is_eof() {
            trace!(key = %self.key, "{message}: end of stream");
            LoopEnd::Eof
        } else {
            warn!(key = %self.key, error = %self.limited_error(e), "{message}");
            LoopEnd::Failed
        }
    }

    fn report(&self, req: Req, request_time: DateTime<Utc>, resp: Option<(Resp, DateTime<Utc>)>) {
        let destination = self
            .activity
            .peers()
            .map(|(_, server)| Destination {
                ip: server.address.to_string(),
                port: server.port,
            })
            .unwrap_or_default();

        let transaction = HttpTransaction {
            request: req.into_request(request_time, self.id, destination),
            response: resp.map(|(resp, time)| resp.into_response(time, self.id)),
        };

        trace!(
            key = %self.key,
            path = %transaction.request.path,
            code = transaction.response.as_ref().map(|r| r.code),
            "reporting transaction"
        );
        self.processor.process(transaction);
    }

    fn limited_error(&self, e: &HttpError) -> String {
        e.to_string().chars().take(self.limited_error_length).collect()
    }
}
