//! Control channel request/reply codec and framing.
//!
//! Request: `{ type: u32, total_size: u32 }` header, body by type. Reply:
//! `{ result_code: u32, size: u32, payload }`. The rules blob used by
//! AddRules, RemoveRules and both query replies is
//! `{ count: u16, total_rules_bytes: u32, rules }`, each rule packed as
//! `{ major: u16, minor: u16, pattern_bytes: u16, pattern: utf16 }`.

use crate::utf16::{decode_utf16le, encode_utf16le};
use crate::{Cursor, WireError};
use fsgate_core::action::{RuleMajor, RuleMinor};
use fsgate_core::limits::{MAX_CONTROL_MESSAGE_BYTES, MAX_PATH_BYTES};
use fsgate_core::rule::Rule;
use fsgate_core::status::OpStatus;
use fsgate_core::version::CoreVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const REQUEST_HEADER_BYTES: usize = 8;
const REPLY_HEADER_BYTES: usize = 8;

/// Request type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Report the engine version quad.
    GetCoreVersion = 0,
    /// Toggle the accept-unload flag.
    SetUnloadAcceptable = 1,
    /// Toggle the accept-detach flag.
    SetDetachAcceptable = 2,
    /// Insert rules.
    AddRules = 3,
    /// Remove rules by identity.
    RemoveRules = 4,
    /// Snapshot all rules.
    QueryRules = 5,
    /// Snapshot rules matching a path.
    CheckMatchedRule = 6,
    /// Empty the store.
    CleanupRules = 7,
}

impl MessageType {
    fn from_code(code: u32) -> Result<Self, WireError> {
        match code {
            0 => Ok(MessageType::GetCoreVersion),
            1 => Ok(MessageType::SetUnloadAcceptable),
            2 => Ok(MessageType::SetDetachAcceptable),
            3 => Ok(MessageType::AddRules),
            4 => Ok(MessageType::RemoveRules),
            5 => Ok(MessageType::QueryRules),
            6 => Ok(MessageType::CheckMatchedRule),
            7 => Ok(MessageType::CleanupRules),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Report the engine version quad.
    GetCoreVersion,
    /// Toggle the accept-unload flag.
    SetUnloadAcceptable(bool),
    /// Toggle the accept-detach flag.
    SetDetachAcceptable(bool),
    /// Insert rules.
    AddRules(Vec<Rule>),
    /// Remove rules by identity.
    RemoveRules(Vec<Rule>),
    /// Snapshot all rules.
    QueryRules,
    /// Snapshot rules matching the given path.
    CheckMatchedRule(String),
    /// Empty the store.
    CleanupRules,
}

impl Request {
    /// Type code of this request.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::GetCoreVersion => MessageType::GetCoreVersion,
            Request::SetUnloadAcceptable(_) => MessageType::SetUnloadAcceptable,
            Request::SetDetachAcceptable(_) => MessageType::SetDetachAcceptable,
            Request::AddRules(_) => MessageType::AddRules,
            Request::RemoveRules(_) => MessageType::RemoveRules,
            Request::QueryRules => MessageType::QueryRules,
            Request::CheckMatchedRule(_) => MessageType::CheckMatchedRule,
            Request::CleanupRules => MessageType::CleanupRules,
        }
    }

    /// Encode header plus body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Request::GetCoreVersion | Request::QueryRules | Request::CleanupRules => Vec::new(),
            Request::SetUnloadAcceptable(b) | Request::SetDetachAcceptable(b) => {
                vec![u8::from(*b)]
            }
            Request::AddRules(rules) | Request::RemoveRules(rules) => encode_rules_blob(rules),
            Request::CheckMatchedRule(path) => {
                let p = encode_utf16le(path);
                let mut body = Vec::with_capacity(2 + p.len());
                body.extend_from_slice(&(p.len() as u16).to_le_bytes());
                body.extend_from_slice(&p);
                body
            }
        };
        let mut out = Vec::with_capacity(REQUEST_HEADER_BYTES + body.len());
        out.extend_from_slice(&(self.message_type() as u32).to_le_bytes());
        out.extend_from_slice(&((REQUEST_HEADER_BYTES + body.len()) as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a request body given its already-parsed type.
    pub fn decode(ty: MessageType, body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(body);
        let req = match ty {
            MessageType::GetCoreVersion => Request::GetCoreVersion,
            MessageType::QueryRules => Request::QueryRules,
            MessageType::CleanupRules => Request::CleanupRules,
            MessageType::SetUnloadAcceptable => Request::SetUnloadAcceptable(cur.u8()? != 0),
            MessageType::SetDetachAcceptable => Request::SetDetachAcceptable(cur.u8()? != 0),
            MessageType::AddRules => Request::AddRules(decode_rules_blob(&mut cur)?),
            MessageType::RemoveRules => Request::RemoveRules(decode_rules_blob(&mut cur)?),
            MessageType::CheckMatchedRule => {
                let path_bytes = cur.u16()? as usize;
                if path_bytes > MAX_PATH_BYTES {
                    return Err(WireError::InvalidArgument(format!(
                        "path of {path_bytes} bytes exceeds ceiling of {MAX_PATH_BYTES}"
                    )));
                }
                Request::CheckMatchedRule(decode_utf16le(cur.take(path_bytes)?)?)
            }
        };
        if cur.remaining() != 0 {
            return Err(WireError::InvalidArgument(format!(
                "{} trailing bytes after request body",
                cur.remaining()
            )));
        }
        Ok(req)
    }
}

/// Reply payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    /// No payload.
    Empty,
    /// Engine version quad.
    Version(CoreVersion),
    /// Count of rules affected by a mutation.
    AffectedCount(u32),
    /// Rules blob, for query and check-matched replies.
    Rules(Vec<Rule>),
}

/// A control reply: platform result code plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Platform status code; zero is success.
    pub result_code: OpStatus,
    /// Payload carried on success (usually empty on failure).
    pub payload: ReplyPayload,
}

impl Reply {
    /// Success reply with a payload.
    #[must_use]
    pub fn ok(payload: ReplyPayload) -> Self {
        Reply { result_code: OpStatus::SUCCESS, payload }
    }

    /// Failure reply carrying only the status code.
    #[must_use]
    pub fn failed(status: OpStatus) -> Self {
        Reply { result_code: status, payload: ReplyPayload::Empty }
    }

    /// Encode header plus payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload = match &self.payload {
            ReplyPayload::Empty => Vec::new(),
            ReplyPayload::Version(v) => {
                let mut p = Vec::with_capacity(8);
                for part in [v.major, v.minor, v.patch, v.build] {
                    p.extend_from_slice(&part.to_le_bytes());
                }
                p
            }
            ReplyPayload::AffectedCount(n) => n.to_le_bytes().to_vec(),
            ReplyPayload::Rules(rules) => encode_rules_blob(rules),
        };
        let mut out = Vec::with_capacity(REPLY_HEADER_BYTES + payload.len());
        out.extend_from_slice(&self.result_code.code().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode a reply whose payload is expected to be the version quad.
    pub fn decode_version(code: OpStatus, payload: &[u8]) -> Result<Self, WireError> {
        if !code.is_success() {
            return Ok(Reply::failed(code));
        }
        let mut cur = Cursor::new(payload);
        let v = CoreVersion {
            major: cur.u16()?,
            minor: cur.u16()?,
            patch: cur.u16()?,
            build: cur.u16()?,
        };
        Ok(Reply { result_code: code, payload: ReplyPayload::Version(v) })
    }

    /// Decode a reply whose payload is expected to be an affected count.
    pub fn decode_count(code: OpStatus, payload: &[u8]) -> Result<Self, WireError> {
        if !code.is_success() && payload.is_empty() {
            return Ok(Reply::failed(code));
        }
        let mut cur = Cursor::new(payload);
        let n = cur.u32()?;
        Ok(Reply { result_code: code, payload: ReplyPayload::AffectedCount(n) })
    }

    /// Decode a reply whose payload is expected to be a rules blob.
    pub fn decode_rules(code: OpStatus, payload: &[u8]) -> Result<Self, WireError> {
        if !code.is_success() {
            return Ok(Reply::failed(code));
        }
        let mut cur = Cursor::new(payload);
        let rules = decode_rules_blob(&mut cur)?;
        Ok(Reply { result_code: code, payload: ReplyPayload::Rules(rules) })
    }

    /// Decode a reply with no payload.
    pub fn decode_empty(code: OpStatus, _payload: &[u8]) -> Result<Self, WireError> {
        Ok(Reply { result_code: code, payload: ReplyPayload::Empty })
    }
}

fn encode_rules_blob(rules: &[Rule]) -> Vec<u8> {
    let mut packed = Vec::new();
    for r in rules {
        let pattern = encode_utf16le(&r.pattern);
        packed.extend_from_slice(&r.major.wire_code().to_le_bytes());
        packed.extend_from_slice(&r.minor.wire_code().to_le_bytes());
        packed.extend_from_slice(&(pattern.len() as u16).to_le_bytes());
        packed.extend_from_slice(&pattern);
    }
    let mut out = Vec::with_capacity(6 + packed.len());
    out.extend_from_slice(&(rules.len() as u16).to_le_bytes());
    out.extend_from_slice(&(packed.len() as u32).to_le_bytes());
    out.extend_from_slice(&packed);
    out
}

fn decode_rules_blob(cur: &mut Cursor<'_>) -> Result<Vec<Rule>, WireError> {
    let count = cur.u16()? as usize;
    let total = cur.u32()? as usize;
    if total != cur.remaining() {
        return Err(WireError::InvalidArgument(format!(
            "rules blob declares {total} bytes, {} present",
            cur.remaining()
        )));
    }
    let mut rules = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let major_code = cur.u16()?;
        let minor_code = cur.u16()?;
        let major = RuleMajor::from_wire_code(major_code).ok_or_else(|| {
            WireError::InvalidArgument(format!("major action code {major_code} out of range"))
        })?;
        let minor = RuleMinor::from_wire_code(minor_code).ok_or_else(|| {
            WireError::InvalidArgument(format!("minor action code {minor_code} out of range"))
        })?;
        let pattern_bytes = cur.u16()? as usize;
        if pattern_bytes > MAX_PATH_BYTES {
            return Err(WireError::InvalidArgument(format!(
                "pattern of {pattern_bytes} bytes exceeds ceiling of {MAX_PATH_BYTES}"
            )));
        }
        let pattern = decode_utf16le(cur.take(pattern_bytes)?)?;
        let rule = Rule::new(major, minor, pattern)
            .map_err(|e| WireError::InvalidArgument(e.to_string()))?;
        rules.push(rule);
    }
    if cur.remaining() != 0 {
        return Err(WireError::InvalidArgument(format!(
            "{} trailing bytes after rules blob",
            cur.remaining()
        )));
    }
    Ok(rules)
}

/// Write one request to a stream.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    request: &Request,
) -> Result<(), WireError> {
    w.write_all(&request.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one request from a stream. Returns `Ok(None)` on a clean close
/// before any header byte.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Request>, WireError> {
    let mut header = [0u8; REQUEST_HEADER_BYTES];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let ty_code = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    let total = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
    if total < REQUEST_HEADER_BYTES {
        return Err(WireError::InvalidArgument(format!("impossible total size {total}")));
    }
    if total > MAX_CONTROL_MESSAGE_BYTES {
        return Err(WireError::TooLarge { got: total, limit: MAX_CONTROL_MESSAGE_BYTES });
    }
    let mut body = vec![0u8; total - REQUEST_HEADER_BYTES];
    r.read_exact(&mut body).await?;
    // Parse the type only after the body is consumed, so an unknown type
    // leaves the stream positioned at the next message.
    let ty = MessageType::from_code(ty_code)?;
    Request::decode(ty, &body).map(Some)
}

/// Write one reply to a stream.
pub async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: &Reply) -> Result<(), WireError> {
    w.write_all(&reply.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Read one raw reply: status code plus undecoded payload bytes. The caller
/// picks the payload interpretation that matches its request.
pub async fn read_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(OpStatus, Vec<u8>), WireError> {
    let mut header = [0u8; REPLY_HEADER_BYTES];
    r.read_exact(&mut header).await?;
    let code = OpStatus::from_code(u32::from_le_bytes(header[0..4].try_into().expect("4 bytes")));
    let size = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
    if size > MAX_CONTROL_MESSAGE_BYTES {
        return Err(WireError::TooLarge { got: size, limit: MAX_CONTROL_MESSAGE_BYTES });
    }
    let mut payload = vec![0u8; size];
    r.read_exact(&mut payload).await?;
    Ok((code, payload))
}
