//! Length-prefixed JSON frames.
//!
//! ```text
//! +----------------+---------------------------------------+
//! | u32 length BE  | JSON Envelope { version, body }       |
//! +----------------+---------------------------------------+
//! ```

use crate::errors::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub body: T,
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(&Envelope {
        version: PROTOCOL_VERSION,
        body,
    })?;
    if json.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: json.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(json.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: json.len(),
        max: MAX_FRAME_LEN,
    })?;
    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

fn check_len(header: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let envelope: Envelope<T> = serde_json::from_slice(payload)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::Version {
            found: envelope.version,
            expected: PROTOCOL_VERSION,
        });
    }
    Ok(envelope.body)
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, body: &T) -> Result<(), ProtocolError> {
    writer.write_all(&encode(body)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the peer closed before sending any byte.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = check_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_be_bytes());
        let decoded: Option<Vec<String>> = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_eof_before_header_is_no_reply() {
        let decoded: Option<String> = read_frame(&mut Cursor::new(Vec::new())).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &"payload").unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_frame::<_, String>(&mut Cursor::new(buf.clone())).is_err());
        assert!(read_frame::<_, String>(&mut Cursor::new(buf[..2].to_vec())).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        let err = read_frame::<_, String>(&mut Cursor::new(header)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let json = br#"{"version":99,"body":"x"}"#;
        let mut buf = (json.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(json);
        let err = read_frame::<_, String>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Version {
                found: 99,
                expected: PROTOCOL_VERSION
            }
        ));
    }
}
