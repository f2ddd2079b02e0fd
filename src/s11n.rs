//! s11n == serialization. The fixed-size pieces that make up FastCGI records.

use byteorder::{ByteOrder, NetworkEndian};

pub const FASTCGI_VERSION: u8 = 1;

/// Request id reserved for management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = 0xFFFF;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

const FCGI_KEEP_CONN: u8 = 1;

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnections = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FastcgiRecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl FastcgiRecordHeader {
    pub const LEN: usize = 8;

    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        FastcgiRecordHeader {
            version: FASTCGI_VERSION,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: 0,
            reserved: 0,
        }
    }

    /// Reads a header from the first `LEN` bytes of `bytes`.
    pub fn read(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::LEN);
        FastcgiRecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: NetworkEndian::read_u16(&bytes[2..4]),
            content_length: NetworkEndian::read_u16(&bytes[4..6]),
            padding_length: bytes[6],
            reserved: bytes[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.version;
        out[1] = self.record_type;
        NetworkEndian::write_u16(&mut out[2..4], self.request_id);
        NetworkEndian::write_u16(&mut out[4..6], self.content_length);
        out[6] = self.padding_length;
        out[7] = self.reserved;
        out
    }

    /// Content plus padding.
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BeginRequestBody {
    pub role: Role,
    pub keep_connection: bool,
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        NetworkEndian::write_u16(&mut out[0..2], self.role as u16);
        if self.keep_connection {
            out[2] = FCGI_KEEP_CONN;
        }
        out
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    /// Returns `None` if `bytes` is too short.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(EndRequestBody {
            app_status: NetworkEndian::read_u32(&bytes[0..4]),
            protocol_status: bytes[4],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_primitive::FromPrimitive;

    #[test]
    fn header_layout() {
        let header = FastcgiRecordHeader::new(RecordType::Params, 0x0102, 0x0304);
        assert_eq!(header.to_bytes(), [1, 4, 1, 2, 3, 4, 0, 0]);
        assert_eq!(FastcgiRecordHeader::read(&header.to_bytes()), header);
    }

    #[test]
    fn begin_request_flags() {
        let body = BeginRequestBody { role: Role::Responder, keep_connection: false };
        assert_eq!(body.to_bytes(), [0, 1, 0, 0, 0, 0, 0, 0]);
        let body = BeginRequestBody { role: Role::Responder, keep_connection: true };
        assert_eq!(body.to_bytes(), [0, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn end_request_body() {
        let body = EndRequestBody::read(&[0, 0, 1, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(body.app_status, 256);
        assert_eq!(ProtocolStatus::from_u8(body.protocol_status), Some(ProtocolStatus::Overloaded));
        assert!(EndRequestBody::read(&[0, 0, 0]).is_none());
    }

    #[test]
    fn unknown_record_type() {
        assert_eq!(RecordType::from_u8(6), Some(RecordType::Stdout));
        assert_eq!(RecordType::from_u8(12), None);
    }
}
