//! RESP framing for the client listener.
//!
//! Requests arrive either as arrays of bulk strings or as inline commands
//! (space-separated words terminated by a newline). Replies are written with
//! the encoders below.

use std::io::{self, Write};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::command::{Command, Reply};

const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_LINE_LEN: usize = 64 * 1024;
/// Upper bound on what a bulk header alone can make us allocate.
const BULK_PREALLOC: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

fn protocol<T>(msg: impl Into<String>) -> Result<T, RespError> {
    Err(RespError::Protocol(msg.into()))
}

/// Reads one CRLF (or bare LF) terminated line without its terminator.
/// `None` means the peer closed the stream before sending anything.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, RespError> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if n >= MAX_LINE_LEN {
            return protocol("too big request line");
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn parse_len(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

async fn read_bulk<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Bytes, RespError> {
    let header = match read_line(reader).await? {
        Some(header) => header,
        None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    };
    let Some((&b'$', raw_len)) = header.split_first() else {
        return protocol(format!(
            "expected '$', got '{}'",
            String::from_utf8_lossy(header.get(..1).unwrap_or_default())
        ));
    };
    let len = match parse_len(raw_len) {
        Some(len) if len >= 0 && len as usize <= MAX_BULK_LEN => len as usize,
        _ => return protocol("invalid bulk length"),
    };

    // The buffer grows with the bytes actually received.
    let want = len as u64 + 2;
    let mut buf = Vec::with_capacity(len.min(BULK_PREALLOC) + 2);
    let n = (&mut *reader).take(want).read_to_end(&mut buf).await?;
    if (n as u64) < want {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    if &buf[len..] != b"\r\n" {
        return protocol("bulk string not terminated by CRLF");
    }
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

/// Reads the next command from `reader`. Returns `Ok(None)` on a clean EOF
/// between commands. Empty arrays and blank inline lines are skipped.
pub async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Command>, RespError> {
    loop {
        let Some(line) = read_line(reader).await? else {
            return Ok(None);
        };

        if let Some((&b'*', raw_count)) = line.split_first() {
            let count = match parse_len(raw_count) {
                Some(count) if count <= 0 => continue,
                Some(count) if count as usize <= MAX_ARRAY_LEN => count as usize,
                _ => return protocol("invalid multibulk length"),
            };
            let mut args = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                args.push(read_bulk(reader).await?);
            }
            return Ok(Some(Command::new(args)));
        }

        let args: Vec<Bytes> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|word| !word.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        if !args.is_empty() {
            return Ok(Some(Command::new(args)));
        }
    }
}

fn encode_bulk(item: &[u8], buf: &mut Vec<u8>) {
    let _ = write!(buf, "${}\r\n", item.len());
    buf.extend_from_slice(item);
    buf.extend_from_slice(b"\r\n");
}

/// Appends `items` as an array of bulk strings.
pub fn encode_array(items: &[&[u8]], buf: &mut Vec<u8>) {
    let _ = write!(buf, "*{}\r\n", items.len());
    for item in items {
        encode_bulk(item, buf);
    }
}

fn encode_error(msg: &str, buf: &mut Vec<u8>) {
    buf.push(b'-');
    buf.extend(msg.bytes().map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }));
    buf.extend_from_slice(b"\r\n");
}

pub fn encode_reply(reply: &Reply, buf: &mut Vec<u8>) {
    match reply {
        Reply::Ok => buf.extend_from_slice(b"+OK\r\n"),
        Reply::Bulk(value) => encode_bulk(value, buf),
        Reply::Integer(n) => {
            let _ = write!(buf, ":{}\r\n", n);
        }
        Reply::Array(items) => {
            let _ = write!(buf, "*{}\r\n", items.len());
            for item in items {
                encode_bulk(item, buf);
            }
        }
        Reply::Null => buf.extend_from_slice(b"$-1\r\n"),
        Reply::Error(msg) => encode_error(msg, buf),
    }
}
