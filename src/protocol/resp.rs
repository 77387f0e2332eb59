use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::com::{Error, Result};

pub const CRLF: &[u8] = b"\r\n";
pub const PONG_REPLY: &[u8] = b"+PONG\r\n";
pub const OK_REPLY: &[u8] = b"+OK\r\n";
pub const OK_LINE: &[u8] = b"+OK";
pub const PONG_LINE: &[u8] = b"+PONG";
pub const PING_INLINE: &[u8] = b"PING\r\n";

/// Strict non-negative decimal parse: `[0-9]+` only.
///
/// Rejects empty input, signs, and embedded non-digits.
pub fn parse_int(bytes: &[u8]) -> Option<usize> {
    btoi::btou(bytes).ok()
}

/// Parse a RESP length header body. `-1` is the null sentinel; anything
/// else must be a strict non-negative decimal.
pub fn parse_len(bytes: &[u8]) -> Result<Option<usize>> {
    if bytes == b"-1" {
        return Ok(None);
    }
    parse_int(bytes).map(Some).ok_or(Error::Protocol)
}

/// Scan one CRLF-terminated line out of `src` starting at `*pos`.
///
/// Returns `None` when the terminator has not arrived yet; the caller is
/// expected to rewind and wait for more bytes.
pub fn scan_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

/// Copy exactly one RESP reply frame from `reader` to `dst`, verbatim.
///
/// The copy is streaming: bulk payloads pass through in buffer-sized
/// chunks and nested arrays are walked with an explicit count stack, so
/// no complete reply is ever materialized. Each read applies `deadline`.
/// Read-side failures surface as upstream errors; write-side failures
/// mean the client went away.
pub async fn copy_reply<R, W>(reader: &mut R, dst: &mut W, deadline: Duration) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Frames still owed at each nesting level; the root owes one.
    let mut remaining: Vec<usize> = vec![1];

    while let Some(top) = remaining.last_mut() {
        if *top == 0 {
            remaining.pop();
            continue;
        }
        *top -= 1;

        let line = read_reply_line(reader, deadline).await?;
        if line.is_empty() {
            return Err(Error::Protocol);
        }
        dst.write_all(&line)
            .await
            .map_err(|_| Error::ClientGone)?;
        dst.write_all(CRLF).await.map_err(|_| Error::ClientGone)?;

        match line[0] {
            b'+' | b'-' | b':' => {}
            b'$' => {
                if let Some(len) = parse_len(&line[1..])? {
                    copy_bulk_payload(reader, dst, len, deadline).await?;
                }
            }
            b'*' => {
                if let Some(count) = parse_len(&line[1..])? {
                    remaining.push(count);
                }
            }
            _ => return Err(Error::Protocol),
        }
    }

    Ok(())
}

/// Read one CRLF-terminated line, stripping the terminator.
pub async fn read_reply_line<R>(reader: &mut R, deadline: Duration) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = timed(deadline, reader.read_until(b'\n', &mut line)).await?;
    if read == 0 {
        return Err(Error::Io(unexpected_eof()));
    }
    if line.len() < 2 || !line.ends_with(CRLF) {
        return Err(Error::Protocol);
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

async fn copy_bulk_payload<R, W>(
    reader: &mut R,
    dst: &mut W,
    len: usize,
    deadline: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut left = len;
    while left > 0 {
        let take = {
            let chunk = timed(deadline, reader.fill_buf()).await?;
            if chunk.is_empty() {
                return Err(Error::Io(unexpected_eof()));
            }
            let take = chunk.len().min(left);
            dst.write_all(&chunk[..take])
                .await
                .map_err(|_| Error::ClientGone)?;
            take
        };
        reader.consume(take);
        left -= take;
    }

    let mut terminator = [0u8; 2];
    timed(deadline, tokio::io::AsyncReadExt::read_exact(reader, &mut terminator)).await?;
    if terminator != *b"\r\n" {
        return Err(Error::Protocol);
    }
    dst.write_all(CRLF).await.map_err(|_| Error::ClientGone)?;
    Ok(())
}

async fn timed<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::Io(err)),
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream read timed out",
        ))),
    }
}

fn unexpected_eof() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed mid-reply")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(1);

    #[test]
    fn parse_int_accepts_plain_digits_only() {
        assert_eq!(parse_int(b"12345"), Some(12345));
        assert_eq!(parse_int(b"01"), Some(1));
        assert_eq!(parse_int(b"10"), Some(10));

        assert_eq!(parse_int(b""), None);
        assert_eq!(parse_int(b"-1"), None);
        assert_eq!(parse_int(b"+1"), None);
        assert_eq!(parse_int(b"01b"), None);
        assert_eq!(parse_int(b"0b1"), None);
        assert_eq!(parse_int(b"b1"), None);
        assert_eq!(parse_int(b"invalid int"), None);
    }

    #[test]
    fn parse_len_understands_null_sentinel() {
        assert_eq!(parse_len(b"3").unwrap(), Some(3));
        assert_eq!(parse_len(b"-1").unwrap(), None);
        assert!(parse_len(b"-2").is_err());
        assert!(parse_len(b"a").is_err());
        assert!(parse_len(b"").is_err());
    }

    #[test]
    fn scan_line_waits_for_terminator() {
        let mut pos = 0;
        assert_eq!(scan_line(b"+OK\r\nrest", &mut pos), Some(&b"+OK"[..]));
        assert_eq!(pos, 5);

        let mut pos = 0;
        assert_eq!(scan_line(b"+OK\r", &mut pos), None);
        assert_eq!(pos, 0);
    }

    async fn copied(input: &[u8]) -> (Result<()>, Vec<u8>, usize) {
        let mut reader = input;
        let mut out = Vec::new();
        let result = copy_reply(&mut reader, &mut out, DEADLINE).await;
        (result, out, reader.len())
    }

    #[tokio::test]
    async fn copies_terminal_forms_verbatim() {
        for reply in [
            &b"+OK\r\n"[..],
            &b"-ERR something\r\n"[..],
            &b":5\r\n"[..],
            &b":-5\r\n"[..],
            &b"$-1\r\n"[..],
            &b"*-1\r\n"[..],
        ] {
            let (result, out, rest) = copied(reply).await;
            result.unwrap();
            assert_eq!(out, reply);
            assert_eq!(rest, 0);
        }
    }

    #[tokio::test]
    async fn copies_bulk_with_embedded_newlines() {
        let (result, out, rest) = copied(b"$4\r\n1\r\n2\r\nextra").await;
        result.unwrap();
        assert_eq!(out, b"$4\r\n1\r\n2\r\n");
        assert_eq!(rest, 5);
    }

    #[tokio::test]
    async fn copies_nested_arrays_and_leaves_tail() {
        let (result, out, rest) =
            copied(b"*3\r\n$3\r\nabc\r\n$-1\r\n$2\r\nab\r\nmore extra stuff").await;
        result.unwrap();
        assert_eq!(out, b"*3\r\n$3\r\nabc\r\n$-1\r\n$2\r\nab\r\n");
        assert_eq!(rest, b"more extra stuff".len());

        let nested = b"*2\r\n*2\r\n+a\r\n:1\r\n$1\r\nb\r\n";
        let (result, out, rest) = copied(nested).await;
        result.unwrap();
        assert_eq!(out, nested);
        assert_eq!(rest, 0);
    }

    #[tokio::test]
    async fn rejects_malformed_headers() {
        for bad in [
            &b"$a\r\n"[..],
            &b"*a\r\n"[..],
            &b"*1a\r\n$1\r\na\r\n"[..],
            &b"?5\r\n"[..],
        ] {
            let (result, _out, _rest) = copied(bad).await;
            assert!(matches!(result, Err(Error::Protocol)), "copied {bad:?}");
        }
    }

    #[tokio::test]
    async fn rejects_bulk_without_terminator() {
        let (result, _out, _rest) = copied(b"$3\r\n1234\r\n").await;
        assert!(matches!(result, Err(Error::Protocol)));
    }

    #[tokio::test]
    async fn surfaces_truncation_as_io_error() {
        for truncated in [&b"$3\r\n12"[..], &b"*2\r\n$1\r\na\r\n"[..], &b"$1\r\nab"[..]] {
            let (result, _out, _rest) = copied(truncated).await;
            assert!(matches!(result, Err(Error::Io(_))), "copied {truncated:?}");
        }
    }
}
