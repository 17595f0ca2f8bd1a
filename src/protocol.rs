//! PostgreSQL v3 wire protocol framing.
//!
//! Frontend messages borrow their payload and encode straight into the
//! connection's write buffer. Backend messages are decoded with a
//! bounds-checked cursor so a truncated or hostile frame yields a protocol
//! error instead of a panic.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult};
use crate::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;
/// Request code of the SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Request code of the CancelRequest packet.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Parse and Bind carry the parameter count as an Int16.
pub const MAX_PARAMETERS: usize = i16::MAX as usize;

/// Reject parameter lists whose count does not fit the Int16 field of
/// Parse and Bind. Encoding assumes this was checked.
pub fn check_parameter_count(count: usize) -> PgResult<()> {
    if count > MAX_PARAMETERS {
        return Err(PgError::interface(format!(
            "the number of query arguments cannot exceed {}, got {}",
            MAX_PARAMETERS, count
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    #[default]
    Binary = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "unknown transaction status {:?}",
                other as char
            ))),
        }
    }
}

/// Target of a `Describe` or `Close` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

#[derive(Debug)]
pub enum Frontend<'a> {
    Startup {
        params: &'a [(String, String)],
    },
    SslRequest,
    CancelRequest {
        process_id: i32,
        secret_key: i32,
    },
    Password(&'a str),
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    Parse {
        name: &'a str,
        query: &'a str,
        param_types: &'a [Oid],
    },
    Bind {
        statement: &'a str,
        params: &'a [PgValue],
        result_format: Format,
    },
    Describe {
        target: Target,
        name: &'a str,
    },
    Execute,
    Close {
        target: Target,
        name: &'a str,
    },
    Sync,
    Terminate,
}

impl Frontend<'_> {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frontend::Startup { params } => frame(buf, None, |buf| {
                buf.put_i32(PROTOCOL_VERSION);
                for (key, value) in params.iter() {
                    put_cstr(buf, key);
                    put_cstr(buf, value);
                }
                buf.put_u8(0);
            }),
            Frontend::SslRequest => frame(buf, None, |buf| buf.put_i32(SSL_REQUEST_CODE)),
            Frontend::CancelRequest {
                process_id,
                secret_key,
            } => frame(buf, None, |buf| {
                buf.put_i32(CANCEL_REQUEST_CODE);
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
            }),
            Frontend::Password(password) => frame(buf, Some(b'p'), |buf| put_cstr(buf, password)),
            Frontend::SaslInitialResponse { mechanism, data } => {
                frame(buf, Some(b'p'), |buf| {
                    put_cstr(buf, mechanism);
                    buf.put_i32(data.len() as i32);
                    buf.put_slice(data);
                })
            }
            Frontend::SaslResponse(data) => frame(buf, Some(b'p'), |buf| buf.put_slice(data)),
            Frontend::Query(query) => frame(buf, Some(b'Q'), |buf| put_cstr(buf, query)),
            Frontend::Parse {
                name,
                query,
                param_types,
            } => frame(buf, Some(b'P'), |buf| {
                put_cstr(buf, name);
                put_cstr(buf, query);
                buf.put_i16(param_types.len() as i16);
                for oid in param_types.iter() {
                    buf.put_u32(oid.0);
                }
            }),
            Frontend::Bind {
                statement,
                params,
                result_format,
            } => frame(buf, Some(b'B'), |buf| {
                // unnamed portal
                buf.put_u8(0);
                put_cstr(buf, statement);
                buf.put_i16(1);
                buf.put_i16(Format::Binary as i16);
                buf.put_i16(params.len() as i16);
                for param in params.iter() {
                    param.write_binary(buf);
                }
                buf.put_i16(1);
                buf.put_i16(*result_format as i16);
            }),
            Frontend::Describe { target, name } => frame(buf, Some(b'D'), |buf| {
                buf.put_u8(target.byte());
                put_cstr(buf, name);
            }),
            Frontend::Execute => frame(buf, Some(b'E'), |buf| {
                buf.put_u8(0);
                buf.put_i32(0);
            }),
            Frontend::Close { target, name } => frame(buf, Some(b'C'), |buf| {
                buf.put_u8(target.byte());
                put_cstr(buf, name);
            }),
            Frontend::Sync => frame(buf, Some(b'S'), |_| {}),
            Frontend::Terminate => frame(buf, Some(b'X'), |_| {}),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

/// Write one frame: optional tag, then a length covering itself and the body.
fn frame(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: Oid,
    pub format: Format,
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl { mechanisms: Vec<String> },
    AuthenticationSaslContinue { data: Bytes },
    AuthenticationSaslFinal { data: Bytes },
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription { type_oids: Vec<Oid> },
}

impl BackendMessage {
    /// Split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse_frame(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_FRAME_LEN {
            return Err(PgError::Protocol(format!("invalid frame length {}", len)));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut frame = buf.split_to(total).freeze();
        let tag = frame.get_u8();
        frame.advance(4);
        Self::decode(tag, Cursor(frame)).map(Some)
    }

    fn decode(tag: u8, mut body: Cursor) -> PgResult<Self> {
        let msg = match tag {
            b'R' => return Self::decode_auth(body),
            b'T' => {
                let count = body.i16()?.max(0) as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = body.cstr()?;
                    // table oid, column attr
                    body.skip(6)?;
                    let type_oid = Oid(body.i32()? as u32);
                    // type size, type modifier
                    body.skip(6)?;
                    let format = if body.i16()? == 0 {
                        Format::Text
                    } else {
                        Format::Binary
                    };
                    fields.push(FieldDescription {
                        name,
                        type_oid,
                        format,
                    });
                }
                BackendMessage::RowDescription { fields }
            }
            b'D' => {
                let count = body.i16()?.max(0) as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = body.i32()?;
                    if len < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(body.take(len as usize)?));
                    }
                }
                BackendMessage::DataRow { values }
            }
            b'C' => BackendMessage::CommandComplete { tag: body.cstr()? },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from_byte(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: body.error_fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: body.error_fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstr()?,
                value: body.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = body.i16()?.max(0) as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid(body.i32()? as u32));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstr()?,
                payload: body.cstr()?,
            },
            other => {
                return Err(PgError::Protocol(format!(
                    "unknown message type {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }

    fn decode_auth(mut body: Cursor) -> PgResult<Self> {
        match body.i32()? {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.take(4)?);
                Ok(BackendMessage::AuthenticationMd5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mechanism = body.cstr()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Ok(BackendMessage::AuthenticationSasl { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSaslContinue { data: body.0 }),
            12 => Ok(BackendMessage::AuthenticationSaslFinal { data: body.0 }),
            other => Err(PgError::Auth(format!(
                "unsupported authentication method {}",
                other
            ))),
        }
    }
}

/// Bounds-checked reader over a frame body.
struct Cursor(Bytes);

impl Cursor {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.0.remaining() < n {
            return Err(PgError::Protocol("truncated message".to_string()));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn skip(&mut self, n: usize) -> PgResult<()> {
        self.need(n)?;
        self.0.advance(n);
        Ok(())
    }

    fn take(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn cstr(&mut self) -> PgResult<String> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| PgError::Protocol("missing string terminator".to_string()))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        loop {
            let code = self.u8()?;
            if code == 0 {
                return Ok(fields);
            }
            fields.insert(code, self.cstr()?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count_limit() {
        assert!(check_parameter_count(0).is_ok());
        assert!(check_parameter_count(MAX_PARAMETERS).is_ok());
        assert!(matches!(
            check_parameter_count(MAX_PARAMETERS + 1),
            Err(PgError::Interface(ref msg)) if msg.contains("32767")
        ));
    }

    #[test]
    fn test_ssl_request_is_eight_bytes() {
        let encoded = Frontend::SslRequest.to_bytes();
        assert_eq!(&encoded[..], &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[test]
    fn test_cancel_request_layout() {
        let encoded = Frontend::CancelRequest {
            process_id: 1234,
            secret_key: -7,
        }
        .to_bytes();
        assert_eq!(encoded.len(), 16);
        assert_eq!(&encoded[..4], &16i32.to_be_bytes());
        assert_eq!(&encoded[4..8], &CANCEL_REQUEST_CODE.to_be_bytes());
        assert_eq!(&encoded[8..12], &1234i32.to_be_bytes());
        assert_eq!(&encoded[12..], &(-7i32).to_be_bytes());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut buf = BytesMut::from(&[b'Z', 0, 0, 0, 5][..]);
        assert!(BackendMessage::parse_frame(&mut buf).unwrap().is_none());
        buf.put_u8(b'T');
        let msg = BackendMessage::parse_frame(&mut buf).unwrap().unwrap();
        assert!(matches!(
            msg,
            BackendMessage::ReadyForQuery {
                status: TransactionStatus::InTransaction
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_body_is_protocol_error() {
        // BackendKeyData claiming 12 bytes but carrying only one i32
        let mut buf = BytesMut::from(&[b'K', 0, 0, 0, 8, 0, 0, 0, 1][..]);
        let err = BackendMessage::parse_frame(&mut buf).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }
}
