use super::error::{Error, Result};
use super::s11n::*;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BytesMut};
use enum_primitive::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use std::io;

#[derive(Debug)]
pub struct FastcgiRecord {
    pub request_id: u16,
    pub body: FastcgiRecordBody,
}

#[derive(Debug)]
pub enum FastcgiRecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    Params(BytesMut), // one chunk of the encoded name-value stream
    Stdin(BytesMut),
    GetValues(Vec<String>),
    Stdout(BytesMut),
    Stderr(BytesMut),
    EndRequest(EndRequest),
    GetValuesResult(Vec<(BytesMut, BytesMut)>),
    UnknownTypeResponse(u8),
    UnexpectedType(u8, BytesMut), // anything an application should never send us
}

impl FastcgiRecordBody {
    /// The wire value of this record's type.
    pub fn record_type(&self) -> u8 {
        let typ = match *self {
            FastcgiRecordBody::BeginRequest(_) => RecordType::BeginRequest,
            FastcgiRecordBody::AbortRequest => RecordType::AbortRequest,
            FastcgiRecordBody::Params(_) => RecordType::Params,
            FastcgiRecordBody::Stdin(_) => RecordType::Stdin,
            FastcgiRecordBody::GetValues(_) => RecordType::GetValues,
            FastcgiRecordBody::Stdout(_) => RecordType::Stdout,
            FastcgiRecordBody::Stderr(_) => RecordType::Stderr,
            FastcgiRecordBody::EndRequest(_) => RecordType::EndRequest,
            FastcgiRecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            FastcgiRecordBody::UnknownTypeResponse(_) => RecordType::UnknownType,
            FastcgiRecordBody::UnexpectedType(typ, _) => return typ,
        };
        typ as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BeginRequest {
    pub role: Role,
    pub keep_connection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequest {
    /// The protocol status, if it is one the protocol defines.
    pub fn status(&self) -> Option<ProtocolStatus> {
        ProtocolStatus::from_u8(self.protocol_status)
    }
}

#[derive(Debug, Default)]
pub struct FastcgiClientCodec;

fn malformed<T: Into<String>>(msg: T) -> Error {
    let msg = msg.into();
    error!("{}", msg);
    Error::Malformed(msg)
}

fn read_len(buf: &mut BytesMut) -> Result<usize> {
    match buf.first() {
        None => Err(malformed("truncated name-value length")),
        Some(&first_byte) if first_byte < 0x80 => {
            buf.advance(1);
            Ok(first_byte as usize)
        }
        Some(_) => {
            if buf.len() < 4 {
                return Err(malformed("truncated 4-byte name-value length"));
            }
            Ok(NetworkEndian::read_u32(&buf.split_to(4)) as usize & !0x8000_0000)
        }
    }
}

fn write_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.extend_from_slice(&[len as u8]);
    } else if len < 0x8000_0000 {
        let mut bytes = [0u8; 4];
        NetworkEndian::write_u32(bytes.as_mut(), len as u32 | 0x8000_0000);
        buf.extend_from_slice(bytes.as_ref());
    } else {
        error!("un-encodable name-value pair length: {:#x}", len);
        return Err(Error::NameValueTooLong(len));
    }
    Ok(())
}

/// Decodes a complete name-value stream.
pub fn read_params(buf: &mut BytesMut) -> Result<Vec<(BytesMut, BytesMut)>> {
    let mut params = vec![];
    while !buf.is_empty() {
        let name_len = read_len(buf)?;
        let value_len = read_len(buf)?;
        let pair_len = name_len.checked_add(value_len)
            .ok_or_else(|| malformed("name-value pair length overflows"))?;
        if buf.len() < pair_len {
            return Err(malformed(format!(
                "name-value pair of {} + {} bytes overruns the {} bytes left",
                name_len, value_len, buf.len())));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        debug!("param ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&value));
        params.push((name, value));
    }
    Ok(params)
}

/// Encodes name-value pairs as one contiguous stream. Callers split it into records.
pub fn write_params<I, K, V>(params: I) -> Result<BytesMut>
    where I: IntoIterator<Item = (K, V)>,
          K: AsRef<[u8]>,
          V: AsRef<[u8]>
{
    let mut out = BytesMut::new();
    for (name, value) in params {
        let (name, value) = (name.as_ref(), value.as_ref());
        write_len(&mut out, name.len())?;
        write_len(&mut out, value.len())?;
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    Ok(out)
}

impl Decoder for FastcgiClientCodec {
    type Item = FastcgiRecord;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if buf.len() < FastcgiRecordHeader::LEN {
            debug!("insufficient buffer for header");
            return Ok(None);
        }

        // Only peek at the header until the whole record is buffered.
        let header = FastcgiRecordHeader::read(&buf[..FastcgiRecordHeader::LEN]);
        if header.version != FASTCGI_VERSION {
            error!("unexpected FCGI version {}", header.version);
            return Err(Error::UnsupportedVersion(header.version));
        }
        if buf.len() < FastcgiRecordHeader::LEN + header.body_len() {
            debug!("insufficient buffer for record");
            return Ok(None);
        }

        buf.advance(FastcgiRecordHeader::LEN);
        let content_len = header.content_length as usize;
        let mut content = buf.split_to(content_len);
        buf.advance(header.padding_length as usize);

        let request_id = header.request_id;
        let record_type = RecordType::from_u8(header.record_type);
        debug!("request id: {}; record type: {:?}, {} bytes of content",
               request_id, record_type, content_len);

        let body = match record_type {
            Some(RecordType::Stdout) => FastcgiRecordBody::Stdout(content),
            Some(RecordType::Stderr) => FastcgiRecordBody::Stderr(content),
            Some(RecordType::EndRequest) => {
                let raw = EndRequestBody::read(&content).ok_or_else(|| {
                    malformed(format!("EndRequest body of {} bytes", content_len))
                })?;
                FastcgiRecordBody::EndRequest(EndRequest {
                    app_status: raw.app_status,
                    protocol_status: raw.protocol_status,
                })
            },
            Some(RecordType::GetValuesResult) => {
                FastcgiRecordBody::GetValuesResult(read_params(&mut content)?)
            },
            Some(RecordType::UnknownType) => {
                let typ = content.first().copied()
                    .ok_or_else(|| malformed("empty UnknownType body"))?;
                FastcgiRecordBody::UnknownTypeResponse(typ)
            },
            Some(other) => {
                warn!("illegal record type {:?} from FastCGI application", other);
                FastcgiRecordBody::UnexpectedType(header.record_type, content)
            },
            None => {
                warn!("unknown record type {}", header.record_type);
                FastcgiRecordBody::UnexpectedType(header.record_type, content)
            },
        };

        debug!("buffer now has {} bytes", buf.len());

        Ok(Some(FastcgiRecord {
            request_id,
            body,
        }))
    }
}

impl Encoder<FastcgiRecord> for FastcgiClientCodec {
    type Error = Error;

    fn encode(&mut self, msg: FastcgiRecord, buf: &mut BytesMut) -> Result<()> {
        let (record_type, data): (RecordType, BytesMut) = match msg.body {
            FastcgiRecordBody::BeginRequest(begin) => {
                let body = BeginRequestBody {
                    role: begin.role,
                    keep_connection: begin.keep_connection,
                };
                (RecordType::BeginRequest, BytesMut::from(&body.to_bytes()[..]))
            },
            FastcgiRecordBody::AbortRequest => (RecordType::AbortRequest, BytesMut::new()),
            FastcgiRecordBody::Params(data) => (RecordType::Params, data),
            FastcgiRecordBody::Stdin(data) => (RecordType::Stdin, data),
            FastcgiRecordBody::GetValues(names) => {
                let pairs = names.iter().map(|name| (name.as_str(), ""));
                (RecordType::GetValues, write_params(pairs)?)
            },
            other => {
                let msg = format!("illegal record {:?} from FastCGI client", other);
                error!("{}", msg);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, msg).into());
            }
        };

        if data.len() > MAX_CONTENT_LENGTH {
            error!("{:?} record is too long: {}", record_type, data.len());
            return Err(Error::RecordTooLong { record_type: record_type as u8, len: data.len() });
        }

        let header = FastcgiRecordHeader::new(record_type, msg.request_id, data.len() as u16);
        buf.reserve(FastcgiRecordHeader::LEN + data.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&data);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(record_type: RecordType, request_id: u16, content: &[u8], padding: u8) -> Vec<u8> {
        let mut header = FastcgiRecordHeader::new(record_type, request_id, content.len() as u16);
        header.padding_length = padding;
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(content);
        out.extend(std::iter::repeat(0xAA).take(padding as usize));
        out
    }

    #[test]
    fn params_round_trip() {
        let mut params = HashMap::new();
        params.insert("SCRIPT_NAME".to_owned(), "/foo".to_owned());
        params.insert("QUERY_STRING".to_owned(), String::new());

        let mut encoded = write_params(&params).unwrap();
        let decoded: HashMap<String, String> = read_params(&mut encoded).unwrap()
            .into_iter()
            .map(|(name, value)| {
                (String::from_utf8(name.to_vec()).unwrap(),
                 String::from_utf8(value.to_vec()).unwrap())
            })
            .collect();
        assert_eq!(decoded, params);
    }

    #[test]
    fn short_and_long_lengths() {
        let name = "n".repeat(127);
        let value = "v".repeat(128);
        let encoded = write_params(vec![(name.as_str(), value.as_str())]).unwrap();
        assert_eq!(encoded[0], 127);
        assert_eq!(&encoded[1..5], &[0x80, 0, 0, 128]);
        assert_eq!(encoded.len(), 1 + 4 + 127 + 128);
    }

    #[test]
    fn truncated_params_are_malformed() {
        let mut buf = BytesMut::from(&[5u8, 0, b'a', b'b'][..]);
        assert!(read_params(&mut buf).unwrap_err().is_protocol_violation());
        let mut buf = BytesMut::from(&[0x80u8, 0][..]);
        assert!(read_params(&mut buf).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn huge_pair_lengths_are_malformed() {
        let mut buf = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, b'a'][..]);
        match read_params(&mut buf) {
            Err(Error::Malformed(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn decode_waits_for_padding() {
        let bytes = record(RecordType::Stdout, 3, b"hello", 3);
        let mut codec = FastcgiClientCodec;
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let rec = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(rec.request_id, 3);
        match rec.body {
            FastcgiRecordBody::Stdout(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected body {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_end_request() {
        let bytes = record(RecordType::EndRequest, 9, &[0, 0, 0, 7, 0, 0, 0, 0], 0);
        let rec = FastcgiClientCodec.decode(&mut BytesMut::from(&bytes[..])).unwrap().unwrap();
        match rec.body {
            FastcgiRecordBody::EndRequest(end) => {
                assert_eq!(end.app_status, 7);
                assert_eq!(end.status(), Some(ProtocolStatus::RequestComplete));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn decode_flags_foreign_types() {
        let bytes = record(RecordType::BeginRequest, 1, &[0, 1, 0, 0, 0, 0, 0, 0], 0);
        let rec = FastcgiClientCodec.decode(&mut BytesMut::from(&bytes[..])).unwrap().unwrap();
        assert!(matches!(rec.body, FastcgiRecordBody::UnexpectedType(1, _)));

        let mut bytes = record(RecordType::Stdout, 1, b"", 0);
        bytes[1] = 42;
        let rec = FastcgiClientCodec.decode(&mut BytesMut::from(&bytes[..])).unwrap().unwrap();
        assert!(matches!(rec.body, FastcgiRecordBody::UnexpectedType(42, _)));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = record(RecordType::Stdout, 1, b"x", 0);
        bytes[0] = 2;
        let err = FastcgiClientCodec.decode(&mut BytesMut::from(&bytes[..])).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(2)));
    }

    #[test]
    fn encode_begin_request() {
        let mut buf = BytesMut::new();
        FastcgiClientCodec.encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::BeginRequest(BeginRequest {
                role: Role::Responder,
                keep_connection: false,
            }),
        }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 1, 0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn encode_abort_request() {
        let mut buf = BytesMut::new();
        FastcgiClientCodec.encode(FastcgiRecord {
            request_id: 0x0203,
            body: FastcgiRecordBody::AbortRequest,
        }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[1, 2, 2, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn encode_rejects_oversized_content() {
        let mut buf = BytesMut::new();
        let err = FastcgiClientCodec.encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::Stdin(BytesMut::from(&vec![0u8; 0x10000][..])),
        }, &mut buf).unwrap_err();
        assert!(matches!(err, Error::RecordTooLong { len: 0x10000, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_get_values() {
        let mut buf = BytesMut::new();
        FastcgiClientCodec.encode(FastcgiRecord {
            request_id: MANAGEMENT_REQUEST_ID,
            body: FastcgiRecordBody::GetValues(vec![FCGI_MAX_REQS.to_owned()]),
        }, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[1, 9, 0, 0, 0, 15, 0, 0]);
        assert_eq!(&buf[8..], b"\x0d\x00FCGI_MAX_REQS");
    }
}
