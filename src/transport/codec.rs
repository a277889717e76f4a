//! Wire framing for data-port traffic.
//!
//! Every frame is `[u16 length][type name]\n[payload]`. The length is
//! big-endian and counts the whole body (type name, delimiter and payload).
//! Payloads are opaque bytes; only the type name is interpreted here.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::error::{Error, Result};

pub const HEADER_LEN: usize = 2;

/// Largest body a `u16` header can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

pub const TYPE_DELIMITER: u8 = b'\n';

/// Reserved type name of the introduction frame sent first on every
/// data-port connection.
pub const INTRO_TYPE: &str = "__intro__";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("frame body has no type delimiter")]
    MissingDelimiter,
    #[error("frame has an empty type name")]
    EmptyTypeName,
    #[error("frame type name is not valid utf-8")]
    InvalidTypeName,
}

/// Encodes one frame.
pub fn encode(type_name: &str, payload: &[u8]) -> Result<Vec<u8>> {
    validate_type_name(type_name)?;
    let body_len = type_name.len() + 1 + payload.len();
    if body_len > MAX_BODY_LEN {
        return Err(Error::FrameTooLarge {
            size: body_len,
            max: MAX_BODY_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
    frame.extend_from_slice(&(body_len as u16).to_be_bytes());
    frame.extend_from_slice(type_name.as_bytes());
    frame.push(TYPE_DELIMITER);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn validate_type_name(type_name: &str) -> Result<()> {
    if type_name.is_empty() || type_name.as_bytes().contains(&TYPE_DELIMITER) {
        return Err(Error::InvalidTypeName(type_name.to_string()));
    }
    Ok(())
}

/// Interprets a 2-byte header as the body length.
pub fn decode_header(header: [u8; HEADER_LEN]) -> usize {
    u16::from_be_bytes(header) as usize
}

/// Splits a frame body into its type name and payload on the first delimiter.
pub fn split(body: &[u8]) -> std::result::Result<(&str, &[u8]), DecodeError> {
    let pos = body
        .iter()
        .position(|b| *b == TYPE_DELIMITER)
        .ok_or(DecodeError::MissingDelimiter)?;
    if pos == 0 {
        return Err(DecodeError::EmptyTypeName);
    }
    let type_name = std::str::from_utf8(&body[..pos]).map_err(|_| DecodeError::InvalidTypeName)?;
    Ok((type_name, &body[pos + 1..]))
}

/// Decodes a complete frame held in memory, header included.
pub fn decode(frame: &[u8]) -> std::result::Result<(&str, &[u8]), DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }
    let len = decode_header([frame[0], frame[1]]);
    let body = &frame[HEADER_LEN..];
    if body.len() < len {
        return Err(DecodeError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    split(&body[..len])
}

/// Reads one frame body from a stream.
///
/// Returns `Ok(None)` on a clean end of stream between frames. An end of
/// stream inside a frame, header included, is an error: the stream can no
/// longer be resynced.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: filled,
            }
            .into());
        }
        filled += n;
    }

    let len = decode_header(header);
    let mut body = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = reader.read(&mut body[read..]).await?;
        if n == 0 {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: read,
            }
            .into());
        }
        read += n;
    }
    Ok(Some(body))
}

/// Encodes an introduction frame announcing `name`.
pub fn encode_intro(name: &str) -> Result<Vec<u8>> {
    encode(INTRO_TYPE, name.as_bytes())
}

/// Extracts the introduced name from a frame body, if it is an intro frame.
pub fn parse_intro(body: &[u8]) -> Option<String> {
    match split(body) {
        Ok((INTRO_TYPE, name)) => std::str::from_utf8(name).ok().map(str::to_string),
        _ => None,
    }
}
