//! The shared connection: one write lock for whole outbound sequences, and a read side that
//! any session may pump, routing records for other in-flight requests to their queues.

use crate::error::{Error, Result};
use crate::lowlevel::{FastcgiClientCodec, FastcgiRecord};
use crate::s11n::MANAGEMENT_REQUEST_ID;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Condvar, Mutex, MutexGuard};

use super::lock;

struct RecordReader<R> {
    inner: R,
    buf: BytesMut,
    codec: FastcgiClientCodec,
    scratch: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    fn read_record(&mut self) -> Result<FastcgiRecord> {
        loop {
            if let Some(record) = self.codec.decode(&mut self.buf)? {
                return Ok(record);
            }

            // Bytes only reach `buf` once a read has returned them.
            let n = loop {
                match self.inner.read(&mut self.scratch) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("read failed: {}", e);
                        return Err(e.into());
                    }
                }
            };
            self.buf.extend_from_slice(&self.scratch[..n]);

            if n == 0 {
                let msg = if self.buf.is_empty() {
                    "connection closed"
                } else {
                    "connection closed in the middle of a record"
                };
                debug!("{}", msg);
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg).into());
            }
        }
    }
}

#[derive(Default)]
struct Routing {
    queues: HashMap<u16, VecDeque<FastcgiRecord>>,
    reading: bool,
}

pub struct Connection<R, W> {
    reader: Mutex<RecordReader<R>>,
    writer: Mutex<W>,
    routing: Mutex<Routing>,
    routed: Condvar,
}

/// Keeps a request id registered for incoming records until dropped.
pub struct Registration<'a, R, W> {
    conn: &'a Connection<R, W>,
    id: u16,
}

impl<'a, R, W> Drop for Registration<'a, R, W> {
    fn drop(&mut self) {
        let mut routing = lock(&self.conn.routing);
        if let Some(queue) = routing.queues.remove(&self.id) {
            if !queue.is_empty() {
                warn!("request {} finished with {} unread records", self.id, queue.len());
            }
        }
    }
}

/// This session's turn at reading the shared stream. Finishing it (or unwinding past it)
/// clears the reading flag and wakes the waiting sessions.
struct ReadingTurn<'a, R, W> {
    conn: &'a Connection<R, W>,
    finished: bool,
}

impl<'a, R, W> ReadingTurn<'a, R, W> {
    /// Ends the turn and hands back the routing table, still locked.
    fn finish(mut self) -> MutexGuard<'a, Routing> {
        self.finished = true;
        let conn = self.conn;
        let mut routing = lock(&conn.routing);
        routing.reading = false;
        conn.routed.notify_all();
        routing
    }
}

impl<'a, R, W> Drop for ReadingTurn<'a, R, W> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("reader unwound mid-record, handing the stream to the next session");
            lock(&self.conn.routing).reading = false;
            self.conn.routed.notify_all();
        }
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    pub fn new(reader: R, writer: W, chunk_size: usize) -> Self {
        Connection {
            reader: Mutex::new(RecordReader {
                inner: reader,
                buf: BytesMut::new(),
                codec: FastcgiClientCodec,
                scratch: vec![0; chunk_size.max(1)],
            }),
            writer: Mutex::new(writer),
            routing: Mutex::new(Routing::default()),
            routed: Condvar::new(),
        }
    }

    /// Records for `id` are collected from now on instead of being treated as strays.
    pub fn register(&self, id: u16) -> Registration<'_, R, W> {
        let previous = lock(&self.routing).queues.insert(id, VecDeque::new());
        if previous.is_some() {
            warn!("request {} registered twice", id);
        }
        Registration { conn: self, id }
    }

    /// Writes `bytes` as one unit; no other session's records can land in between.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        debug!("writing {} bytes", bytes.len());
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the next record for `id`, reading from the connection if no other session is
    /// already doing so.
    pub fn next_record(&self, id: u16) -> Result<FastcgiRecord> {
        let mut routing = lock(&self.routing);
        loop {
            if let Some(record) = routing.queues.get_mut(&id).and_then(VecDeque::pop_front) {
                return Ok(record);
            }
            if routing.reading {
                routing = self.routed.wait(routing).unwrap_or_else(|e| e.into_inner());
                continue;
            }

            routing.reading = true;
            drop(routing);
            let turn = ReadingTurn { conn: self, finished: false };
            let result = lock(&self.reader).read_record();
            routing = turn.finish();

            let record = result?;
            if record.request_id == id {
                return Ok(record);
            }
            match routing.queues.get_mut(&record.request_id) {
                Some(queue) => {
                    debug!("stashing record for request {}", record.request_id);
                    queue.push_back(record);
                },
                None if record.request_id == MANAGEMENT_REQUEST_ID => {
                    error!("unexpected management record {:?}", record.body);
                    return Err(Error::UnexpectedRecord {
                        record_type: record.body.record_type(),
                        request_id: record.request_id,
                    });
                },
                None => {
                    error!("record for request {} which is not in flight", record.request_id);
                    return Err(Error::UnexpectedRequestId { request_id: record.request_id });
                },
            }
        }
    }
}
