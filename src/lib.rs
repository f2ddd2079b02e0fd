extern crate byteorder;
extern crate bytes;
#[macro_use] extern crate enum_primitive;
extern crate futures;
#[macro_use] extern crate log;
extern crate thiserror;
extern crate tokio_util;

mod client;
mod config;
mod error;
mod lowlevel;
mod s11n;

pub use client::{Client, IdAllocator, IdLease, Request};
pub use client::ids::REQUEST_ID_SPACE;
pub use config::{ClientConfig, DEFAULT_READ_CHUNK_SIZE};
pub use error::{Error, Result};
pub use lowlevel::{FastcgiClientCodec, FastcgiRecord, FastcgiRecordBody, BeginRequest, EndRequest,
                   read_params, write_params};
pub use s11n::{FASTCGI_VERSION, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS,
               MANAGEMENT_REQUEST_ID, MAX_CONTENT_LENGTH, FastcgiRecordHeader, ProtocolStatus,
               RecordType, Role};
