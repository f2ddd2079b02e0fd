//! A blocking FastCGI client for the Responder role.
//!
//! Any number of threads may share one [`Client`]. Each call to [`Client::handle`] writes its
//! whole outbound sequence (BeginRequest, Params, Stdin) under the connection's write lock,
//! then reads until its EndRequest. Records that belong to another in-flight request are set
//! aside for that request, so concurrent sessions never see each other's output.

mod conn;
pub mod ids;
mod request;

pub use self::ids::{IdAllocator, IdLease};
pub use self::request::Request;

use self::conn::Connection;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::lowlevel::*;
use crate::s11n::*;

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use std::cmp;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section in this module leaves its data consistent, so a poisoned lock is
    // still safe to use.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client<R, W> {
    conn: Connection<R, W>,
    ids: Arc<IdAllocator>,
    config: ClientConfig,
    management: Mutex<()>,
}

impl<R: Read, W: Write> Client<R, W> {
    /// A client with its own id allocator, over an established connection's two halves.
    pub fn new(reader: R, writer: W) -> Result<Self> {
        let ids = Arc::new(IdAllocator::new()?);
        Ok(Self::with_allocator(reader, writer, ids))
    }

    /// A client drawing request ids from a shared allocator.
    pub fn with_allocator(reader: R, writer: W, ids: Arc<IdAllocator>) -> Self {
        Self::with_config(reader, writer, ids, ClientConfig::default())
    }

    pub fn with_config(reader: R, writer: W, ids: Arc<IdAllocator>, config: ClientConfig) -> Self {
        Client {
            conn: Connection::new(reader, writer, config.read_chunk_size),
            ids,
            config,
            management: Mutex::new(()),
        }
    }

    pub fn allocator(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Allocates a request id, blocking while every id is in flight.
    pub fn new_request(&self) -> Result<Request> {
        Ok(Request::new(self.ids.lease()?))
    }

    /// Runs `request` to completion, copying its stdout to `out` and its stderr to `err` as
    /// records arrive. The request id is released when this returns, whatever the outcome.
    ///
    /// The EndRequest statuses are returned as sent; a non-zero app status is not an error.
    pub fn handle<O, E>(&self, out: &mut O, err: &mut E, request: Request) -> Result<EndRequest>
        where O: Write,
              E: Write
    {
        let id = request.id();
        let _registration = self.conn.register(id);

        let outbound = self.encode_request(&request)?;
        debug!("request {}: sending {} params, {} bytes of content",
               id, request.params.len(), request.content.len());
        self.conn.write(&outbound)?;

        loop {
            let record = self.conn.next_record(id)?;
            let delivered = match record.body {
                FastcgiRecordBody::Stdout(data) => out.write_all(&data),
                FastcgiRecordBody::Stderr(data) => err.write_all(&data),
                FastcgiRecordBody::EndRequest(end) => {
                    debug!("request {} ended: {:?}", id, end);
                    return Ok(end);
                },
                other => {
                    error!("unexpected record for request {}: {:?}", id, other);
                    return Err(Error::UnexpectedRecord {
                        record_type: other.record_type(),
                        request_id: id,
                    });
                },
            };

            if let Err(e) = delivered {
                error!("request {}: sink failed: {}", id, e);
                if let Err(abort_err) = self.abort(id) {
                    warn!("request {}: could not wind down after sink failure: {}", id, abort_err);
                }
                return Err(e.into());
            }
        }
    }

    /// Sends AbortRequest and discards the request's output up to its EndRequest, so the id
    /// is not released while the application is still sending records for it.
    fn abort(&self, id: u16) -> Result<()> {
        let mut buf = BytesMut::new();
        FastcgiClientCodec.encode(FastcgiRecord {
            request_id: id,
            body: FastcgiRecordBody::AbortRequest,
        }, &mut buf)?;
        self.conn.write(&buf)?;

        loop {
            let record = self.conn.next_record(id)?;
            match record.body {
                FastcgiRecordBody::Stdout(_) | FastcgiRecordBody::Stderr(_) => (),
                FastcgiRecordBody::EndRequest(end) => {
                    debug!("request {} aborted: {:?}", id, end);
                    return Ok(());
                },
                other => {
                    return Err(Error::UnexpectedRecord {
                        record_type: other.record_type(),
                        request_id: id,
                    });
                },
            }
        }
    }

    fn encode_request(&self, request: &Request) -> Result<BytesMut> {
        let id = request.id();
        let mut codec = FastcgiClientCodec;
        let mut buf = BytesMut::new();
        let mut put = |body| codec.encode(FastcgiRecord { request_id: id, body }, &mut buf);

        put(FastcgiRecordBody::BeginRequest(BeginRequest {
            role: Role::Responder,
            keep_connection: self.config.keep_connection,
        }))?;

        let mut params = write_params(&request.params)?;
        while !params.is_empty() {
            let len = cmp::min(params.len(), MAX_CONTENT_LENGTH);
            put(FastcgiRecordBody::Params(params.split_to(len)))?;
        }
        put(FastcgiRecordBody::Params(BytesMut::new()))?;

        for chunk in request.content.chunks(MAX_CONTENT_LENGTH) {
            put(FastcgiRecordBody::Stdin(BytesMut::from(chunk)))?;
        }
        if self.config.close_stdin {
            put(FastcgiRecordBody::Stdin(BytesMut::new()))?;
        }

        Ok(buf)
    }

    /// Asks the application for the given FCGI_GET_VALUES variables (e.g. [`FCGI_MAX_REQS`]).
    /// Variables the application does not know are absent from the result.
    pub fn get_values(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let _management = lock(&self.management);
        let _registration = self.conn.register(MANAGEMENT_REQUEST_ID);

        let mut buf = BytesMut::new();
        FastcgiClientCodec.encode(FastcgiRecord {
            request_id: MANAGEMENT_REQUEST_ID,
            body: FastcgiRecordBody::GetValues(names.iter().map(|&name| name.to_owned()).collect()),
        }, &mut buf)?;
        self.conn.write(&buf)?;

        let record = self.conn.next_record(MANAGEMENT_REQUEST_ID)?;
        match record.body {
            FastcgiRecordBody::GetValuesResult(values) => {
                Ok(values.into_iter()
                    .map(|(name, value)| {
                        (String::from_utf8_lossy(&name).into_owned(),
                         String::from_utf8_lossy(&value).into_owned())
                    })
                    .collect())
            },
            other => {
                error!("unexpected reply to GetValues: {:?}", other);
                Err(Error::UnexpectedRecord {
                    record_type: other.record_type(),
                    request_id: MANAGEMENT_REQUEST_ID,
                })
            },
        }
    }
}

impl Client<TcpStream, TcpStream> {
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Client::new(reader, stream)
    }
}

#[cfg(unix)]
impl Client<std::os::unix::net::UnixStream, std::os::unix::net::UnixStream> {
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Client::new(reader, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Decoder;

    fn client(config: ClientConfig) -> Client<&'static [u8], Vec<u8>> {
        let ids = Arc::new(IdAllocator::new().unwrap());
        Client::with_config(&[][..], Vec::new(), ids, config)
    }

    fn decode_all(mut buf: BytesMut) -> Vec<FastcgiRecord> {
        let mut records = vec![];
        while let Some(record) = FastcgiClientCodec.decode(&mut buf).unwrap() {
            records.push(record);
        }
        assert!(buf.is_empty());
        records
    }

    // The client codec flags outbound types as unexpected, which is all these tests need.
    fn types(records: &[FastcgiRecord]) -> Vec<u8> {
        records.iter().map(|r| r.body.record_type()).collect()
    }

    #[test]
    fn outbound_sequence() {
        let client = client(ClientConfig::default());
        let mut request = client.new_request().unwrap();
        request.set_param("SCRIPT_NAME", "/foo").set_content(&b"body"[..]);

        let records = decode_all(client.encode_request(&request).unwrap());
        assert_eq!(types(&records), vec![1, 4, 4, 5]);
        assert!(records.iter().all(|r| r.request_id == request.id()));
        match records[2].body {
            FastcgiRecordBody::UnexpectedType(_, ref data) => assert!(data.is_empty()),
            ref other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn no_stdin_without_content() {
        let client = client(ClientConfig::default());
        let request = client.new_request().unwrap();
        let records = decode_all(client.encode_request(&request).unwrap());
        assert_eq!(types(&records), vec![1, 4]);
    }

    #[test]
    fn large_payloads_are_split() {
        let client = client(ClientConfig { close_stdin: true, ..ClientConfig::default() });
        let mut request = client.new_request().unwrap();
        request.set_param("BIG", "x".repeat(70_000));
        request.set_content(vec![7u8; 0x10000 + 10]);

        let records = decode_all(client.encode_request(&request).unwrap());
        assert_eq!(types(&records), vec![1, 4, 4, 4, 5, 5, 5]);

        let mut params = BytesMut::new();
        for record in &records[1..4] {
            if let FastcgiRecordBody::UnexpectedType(_, ref data) = record.body {
                params.extend_from_slice(data);
            }
        }
        let pairs = read_params(&mut params).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.len(), 70_000);
    }

    #[test]
    fn keep_connection_flag() {
        let client = client(ClientConfig { keep_connection: true, ..ClientConfig::default() });
        let request = client.new_request().unwrap();
        let records = decode_all(client.encode_request(&request).unwrap());
        match records[0].body {
            FastcgiRecordBody::UnexpectedType(1, ref data) => assert_eq!(&data[..3], &[0, 1, 1]),
            ref other => panic!("unexpected body {:?}", other),
        }
    }
}
