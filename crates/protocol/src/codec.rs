//! Newline-delimited JSON codec for relay messages
//!
//! Each message is one JSON envelope followed by `\n`. Blank lines are
//! ignored by readers.
//!
//! # Line Format
//!
//! ```text
//! {"event":"transfer_in","payload":{"endpoint":1,"length":64}}\n
//! ```
//!
//! Maximum line size is 1 MiB to bound memory use per message.

use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, InboundCommand};
use serde::Serialize;
use std::io::{BufRead, Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed line size (1 MiB)
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Largest IN transfer whose `["ok", bytes]` response still fits in one line
///
/// Each byte encodes as at most four characters (`255,`).
pub const MAX_TRANSFER_SIZE: usize = MAX_LINE_SIZE / 8;

/// Encode a message as a single line, including the trailing newline
///
/// # Example
/// ```
/// use protocol::{DeviceId, OutboundMessage, encode_line};
///
/// let line = encode_line(&OutboundMessage::DeviceClosed(DeviceId::from("1-2"))).unwrap();
/// assert_eq!(line, b"{\"event\":\"device_closed\",\"payload\":\"1-2\"}\n");
/// ```
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    if line.len() >= MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Decode an envelope from one line (trailing whitespace allowed)
pub fn decode_envelope(line: &[u8]) -> Result<Envelope> {
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    Ok(serde_json::from_slice(line.trim_ascii())?)
}

/// Decode an inbound command from one line
///
/// # Example
/// ```
/// use protocol::{InboundCommand, decode_command};
///
/// let cmd = decode_command(br#"{"event":"get_endpoints"}"#).unwrap();
/// assert_eq!(cmd, InboundCommand::GetEndpoints);
/// ```
pub fn decode_command(line: &[u8]) -> Result<InboundCommand> {
    InboundCommand::from_envelope(decode_envelope(line)?)
}

/// Write one message line to a writer
pub fn write_line<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let line = encode_line(message)?;
    writer.write_all(&line)?;
    Ok(())
}

/// Read the next non-blank line from a reader
///
/// Returns `Ok(None)` at end of stream. The returned bytes exclude the
/// newline.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    loop {
        let mut buf = Vec::new();
        let read = reader
            .by_ref()
            .take(MAX_LINE_SIZE as u64 + 1)
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        match finish_line(buf) {
            Ok(Some(line)) => return Ok(Some(line)),
            Ok(None) => {}
            Err(e) => {
                discard_line(reader)?;
                return Err(e);
            }
        }
    }
}

/// Skip the rest of an oversized line, up to and including its newline
fn discard_line<R: BufRead>(reader: &mut R) -> Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        let (consumed, done) = match buf.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (buf.len(), false),
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

/// Async version of [`write_line`]
#[cfg(feature = "async")]
pub async fn write_line_async<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(message)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Async version of [`read_line`]
#[cfg(feature = "async")]
pub async fn read_line_async<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut buf = Vec::new();
        let read = (&mut *reader)
            .take(MAX_LINE_SIZE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        match finish_line(buf) {
            Ok(Some(line)) => return Ok(Some(line)),
            Ok(None) => {}
            Err(e) => {
                discard_line_async(reader).await?;
                return Err(e);
            }
        }
    }
}

/// Async version of [`discard_line`]
#[cfg(feature = "async")]
async fn discard_line_async<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        let (consumed, done) = match buf.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (buf.len(), false),
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

/// Strip the newline and reject oversized lines; `None` for blank lines
fn finish_line(mut buf: Vec<u8>) -> Result<Option<Vec<u8>>> {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLong {
            size: buf.len(),
            max: MAX_LINE_SIZE,
        });
    }
    if buf.trim_ascii().is_empty() {
        return Ok(None);
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DeviceResponse, OutboundMessage};
    use std::io::Cursor;

    #[test]
    fn test_encode_line_ends_with_newline() {
        let line = encode_line(&OutboundMessage::DeviceResponse(DeviceResponse::Ok)).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"event\":\"device_response\",\"payload\":\"ok\"}\n"
        );
    }

    #[test]
    fn test_read_line_skips_blank_lines() {
        let mut cursor = Cursor::new(b"\n  \n{\"event\":\"get_endpoints\"}\r\n".to_vec());
        let line = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(decode_command(&line).unwrap(), InboundCommand::GetEndpoints);
        assert!(read_line(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_line_rejects_oversized() {
        let data = vec![b'a'; MAX_LINE_SIZE + 10];
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_line(&mut cursor),
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[test]
    fn test_oversized_line_is_skipped_whole() {
        let mut data = vec![b'a'; MAX_LINE_SIZE + 10];
        data.extend_from_slice(b"\n{\"event\":\"get_endpoints\"}\n");
        let mut cursor = Cursor::new(data);

        assert!(matches!(
            read_line(&mut cursor),
            Err(ProtocolError::LineTooLong { .. })
        ));
        let line = read_line(&mut cursor).unwrap().unwrap();
        assert_eq!(decode_command(&line).unwrap(), InboundCommand::GetEndpoints);
        assert!(read_line(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_largest_transfer_response_fits_one_line() {
        let response = OutboundMessage::DeviceResponse(DeviceResponse::Data(vec![
            255;
            MAX_TRANSFER_SIZE
        ]));
        assert!(encode_line(&response).is_ok());
    }

    #[test]
    fn test_last_line_without_newline() {
        let mut cursor = Cursor::new(b"{\"event\":\"get_endpoints\"}".to_vec());
        assert!(read_line(&mut cursor).unwrap().is_some());
    }

    #[test]
    fn test_decode_command_malformed_json() {
        assert!(matches!(
            decode_command(b"{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_line_io() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let mut server_read = tokio::io::BufReader::new(server);

        write_line_async(
            &mut client_write,
            &InboundCommand::GetEndpoints.to_envelope(),
        )
        .await
        .unwrap();

        let line = read_line_async(&mut server_read).await.unwrap().unwrap();
        assert_eq!(decode_command(&line).unwrap(), InboundCommand::GetEndpoints);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_oversized_line_is_skipped_whole() {
        let mut data = vec![b'{'; MAX_LINE_SIZE + 1];
        data.extend_from_slice(b"}}\n{\"event\":\"get_endpoints\"}\n");
        let mut reader = tokio::io::BufReader::new(data.as_slice());

        assert!(matches!(
            read_line_async(&mut reader).await,
            Err(ProtocolError::LineTooLong { .. })
        ));
        let line = read_line_async(&mut reader).await.unwrap().unwrap();
        assert_eq!(decode_command(&line).unwrap(), InboundCommand::GetEndpoints);
        assert!(read_line_async(&mut reader).await.unwrap().is_none());
    }
}
