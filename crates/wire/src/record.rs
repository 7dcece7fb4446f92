//! Monitor channel record and frame codec.
//!
//! A frame is `{ body_size: u32, body }` where the body is a run of
//! tightly-packed records. Record layout (little-endian):
//! `major_fn u8, minor_fn u8, pid u64, tid u64, volume_serial u64,
//! file_id [u8;16], record_time i64, op_status i32, rule_path_bytes u16,
//! file_path_bytes u16, rename_path_bytes u16`, then the three UTF-16LE
//! buffers in rule/file/rename order.

use crate::utf16::{decode_utf16le, encode_utf16le};
use crate::{Cursor, WireError};
use fsgate_core::limits::{FRAME_BODY_BYTES, MAX_PATH_BYTES};
use fsgate_core::record::{FileRef, MonitorRecord, OpMajor};
use fsgate_core::rule::utf16_len;
use fsgate_core::status::OpStatus;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed (non-path) portion of one encoded record.
pub const RECORD_FIXED_BYTES: usize = 1 + 1 + 8 + 8 + 8 + 16 + 8 + 4 + 2 + 2 + 2;

/// Encoded size of a record, fixed part plus all path buffers.
#[must_use]
pub fn encoded_record_len(record: &MonitorRecord) -> usize {
    RECORD_FIXED_BYTES
        + utf16_len(&record.rule_pattern)
        + utf16_len(&record.file_path)
        + record.rename_path.as_deref().map(utf16_len).unwrap_or(0)
}

/// Append one encoded record to `buf`.
pub fn encode_record_into(buf: &mut Vec<u8>, record: &MonitorRecord) {
    let rule = encode_utf16le(&record.rule_pattern);
    let file = encode_utf16le(&record.file_path);
    let rename = record.rename_path.as_deref().map(encode_utf16le).unwrap_or_default();

    buf.push(record.major_fn.wire_code());
    buf.push(record.minor_fn);
    buf.extend_from_slice(&record.pid.to_le_bytes());
    buf.extend_from_slice(&record.tid.to_le_bytes());
    buf.extend_from_slice(&record.file.volume_serial.to_le_bytes());
    buf.extend_from_slice(&record.file.file_id);
    buf.extend_from_slice(&record.record_time.to_le_bytes());
    buf.extend_from_slice(&record.op_status.0.to_le_bytes());
    buf.extend_from_slice(&(rule.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(file.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(rename.len() as u16).to_le_bytes());
    buf.extend_from_slice(&rule);
    buf.extend_from_slice(&file);
    buf.extend_from_slice(&rename);
}

/// Decode one record from the front of `bytes`; returns the record and the
/// number of bytes consumed.
pub fn decode_record(bytes: &[u8]) -> Result<(MonitorRecord, usize), WireError> {
    let mut cur = Cursor::new(bytes);
    let major_code = cur.u8()?;
    let major_fn = OpMajor::from_wire_code(major_code).ok_or_else(|| {
        WireError::InvalidArgument(format!("operation code {major_code} out of range"))
    })?;
    let minor_fn = cur.u8()?;
    let pid = cur.u64()?;
    let tid = cur.u64()?;
    let volume_serial = cur.u64()?;
    let file_id: [u8; 16] = cur.take(16)?.try_into().expect("16-byte slice");
    let record_time = cur.i64()?;
    let op_status = OpStatus(cur.i32()?);
    let rule_bytes = cur.u16()? as usize;
    let file_bytes = cur.u16()? as usize;
    let rename_bytes = cur.u16()? as usize;
    for (label, n) in [("rule", rule_bytes), ("file", file_bytes), ("rename", rename_bytes)] {
        if n > MAX_PATH_BYTES {
            return Err(WireError::InvalidArgument(format!(
                "{label} path of {n} bytes exceeds ceiling"
            )));
        }
    }
    let rule_pattern = decode_utf16le(cur.take(rule_bytes)?)?;
    let file_path = decode_utf16le(cur.take(file_bytes)?)?;
    let rename_path = if rename_bytes == 0 {
        None
    } else {
        Some(decode_utf16le(cur.take(rename_bytes)?)?)
    };

    let consumed = RECORD_FIXED_BYTES + rule_bytes + file_bytes + rename_bytes;
    Ok((
        MonitorRecord {
            major_fn,
            minor_fn,
            pid,
            tid,
            file: FileRef { volume_serial, file_id },
            record_time,
            op_status,
            rule_pattern,
            file_path,
            rename_path,
        },
        consumed,
    ))
}

/// Decode every record in a frame body.
pub fn decode_frame(body: &[u8]) -> Result<Vec<MonitorRecord>, WireError> {
    let mut records = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let (record, consumed) = decode_record(rest)?;
        records.push(record);
        rest = &rest[consumed..];
    }
    Ok(records)
}

/// Write one frame: body size prefix then body.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), WireError> {
    w.write_all(&(body.len() as u32).to_le_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame body. Returns `Ok(None)` on a clean close before any
/// length byte.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, WireError> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_le_bytes(len) as usize;
    if size > FRAME_BODY_BYTES {
        return Err(WireError::TooLarge { got: size, limit: FRAME_BODY_BYTES });
    }
    let mut body = vec![0u8; size];
    r.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsgate_core::record::set_info;

    fn sample(rename: Option<&str>) -> MonitorRecord {
        MonitorRecord {
            major_fn: OpMajor::SetInformation,
            minor_fn: set_info::RENAME,
            pid: 4321,
            tid: 8765,
            file: FileRef { volume_serial: 0xDEAD_BEEF, file_id: [7u8; 16] },
            record_time: 133_000_000_000,
            op_status: OpStatus::ACCESS_DENIED,
            rule_pattern: r"\DEVICE\HD1\LOCKED\*".into(),
            file_path: r"\Device\HD1\Locked\a.txt".into(),
            rename_path: rename.map(String::from),
        }
    }

    #[test]
    fn record_round_trip_with_and_without_rename() {
        for rec in [sample(Some(r"\Device\HD1\Else\b.txt")), sample(None)] {
            let mut buf = Vec::new();
            encode_record_into(&mut buf, &rec);
            assert_eq!(buf.len(), encoded_record_len(&rec));
            let (decoded, consumed) = decode_record(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, rec);
        }
    }

    #[test]
    fn frame_of_records_round_trips_in_order() {
        let mut body = Vec::new();
        let records: Vec<_> = (0..5)
            .map(|i| {
                let mut r = sample(None);
                r.pid = i;
                r
            })
            .collect();
        for r in &records {
            encode_record_into(&mut body, r);
        }
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn truncated_record_rejected() {
        let mut buf = Vec::new();
        encode_record_into(&mut buf, &sample(None));
        buf.truncate(buf.len() - 1);
        assert!(decode_frame(&buf).is_err());
    }
}
