use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::com::{Error, Result};

use super::resp::{parse_len, scan_line};

/// One complete client command: the verbatim multi-bulk span plus the
/// views the pipeline needs to classify and route it.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    buf: Bytes,
    name: Bytes,
    arg_count: usize,
    first_arg: Option<Bytes>,
}

impl CommandFrame {
    /// Lowercased command name.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Number of elements in the multi-bulk array, command name included.
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// The first argument after the command name, if present.
    pub fn first_arg(&self) -> Option<&[u8]> {
        self.first_arg.as_deref()
    }

    /// The full RESP span, forwarded upstream verbatim.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

/// Largest accepted bulk payload, matching the redis proto-max-bulk-len
/// default.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest accepted multi-bulk element count, matching redis.
const MAX_MULTIBULK_LEN: usize = 1024 * 1024;

/// Decoder producing one [`CommandFrame`] per complete client array.
///
/// Only multi-bulk commands are accepted; inline commands and non-bulk
/// top-level elements are protocol errors.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = CommandFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<CommandFrame>> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != b'*' {
            return Err(Error::Protocol);
        }

        let mut pos = 1usize;
        let count = {
            let header = match scan_line(src, &mut pos) {
                Some(line) => line,
                None => return Ok(None),
            };
            match parse_len(header)? {
                Some(count) if count > 0 && count <= MAX_MULTIBULK_LEN => count,
                _ => return Err(Error::Protocol),
            }
        };

        let mut name_span = (0usize, 0usize);
        let mut first_arg_span: Option<(usize, usize)> = None;
        for idx in 0..count {
            if pos >= src.len() {
                return Ok(None);
            }
            if src[pos] != b'$' {
                return Err(Error::Protocol);
            }
            pos += 1;
            let len = {
                let header = match scan_line(src, &mut pos) {
                    Some(line) => line,
                    None => return Ok(None),
                };
                match parse_len(header)? {
                    Some(len) if len <= MAX_BULK_LEN => len,
                    // A null or oversized bulk cannot name or argue a
                    // command.
                    _ => return Err(Error::Protocol),
                }
            };
            if src.len() < pos + len + 2 {
                return Ok(None);
            }
            if &src[pos + len..pos + len + 2] != b"\r\n" {
                return Err(Error::Protocol);
            }
            if idx == 0 {
                name_span = (pos, len);
            } else if idx == 1 {
                first_arg_span = Some((pos, len));
            }
            pos += len + 2;
        }

        let buf = src.split_to(pos).freeze();
        let (name_start, name_len) = name_span;
        let name = Bytes::from(buf[name_start..name_start + name_len].to_ascii_lowercase());
        let first_arg = first_arg_span.map(|(start, len)| buf.slice(start..start + len));
        Ok(Some(CommandFrame {
            buf,
            name,
            arg_count: count,
            first_arg,
        }))
    }
}

/// What the session should do with a classified command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fail immediately with `-ERR unsupported command`.
    Unsupported,
    /// Reply `+PONG` without touching a backend.
    Pong,
    /// Reply and mark the session inactive.
    Quit,
    /// Update the session database cursor and reply `+OK`.
    Select,
    /// Queue for forwarding and advance the transaction state machine.
    Transaction,
    /// Queue for forwarding.
    Forward,
}

/// Decide how a command is handled.
///
/// The denylist is checked first, then the local intercepts, matching the
/// order the upstream policy is applied in.
pub fn classify(frame: &CommandFrame, multiplexing: bool) -> Disposition {
    if !is_supported(frame.name(), multiplexing, frame.arg_count() > 2) {
        return Disposition::Unsupported;
    }

    match frame.name() {
        b"ping" => Disposition::Pong,
        b"quit" => Disposition::Quit,
        b"select" => Disposition::Select,
        b"watch" | b"unwatch" | b"multi" | b"exec" | b"discard" => Disposition::Transaction,
        _ => Disposition::Forward,
    }
}

fn is_supported(name: &[u8], multiplexing: bool, multiple_args: bool) -> bool {
    if always_unsupported(name) {
        return false;
    }
    if multiplexing {
        if unroutable_when_multiplexing(name) {
            return false;
        }
        if multiple_args && multi_key(name) {
            return false;
        }
    }
    true
}

/// Commands that need single-client or server-wide semantics the proxy
/// cannot uphold across shared upstream connections.
fn always_unsupported(name: &[u8]) -> bool {
    matches!(
        name,
        b"subscribe"
            | b"psubscribe"
            | b"unsubscribe"
            | b"punsubscribe"
            | b"publish"
            | b"monitor"
            | b"wait"
            | b"cluster"
            | b"blpop"
            | b"brpop"
            | b"brpoplpush"
            | b"blmove"
            | b"bzpopmin"
            | b"bzpopmax"
            | b"sync"
            | b"psync"
            | b"replicaof"
            | b"slaveof"
            | b"shutdown"
            | b"debug"
            | b"migrate"
            | b"move"
            | b"swapdb"
    )
}

/// Whole-keyspace or keyless commands that cannot be placed on a single
/// shard when multiplexing.
fn unroutable_when_multiplexing(name: &[u8]) -> bool {
    matches!(
        name,
        b"keys"
            | b"scan"
            | b"randomkey"
            | b"dbsize"
            | b"flushdb"
            | b"flushall"
            | b"script"
            | b"eval"
            | b"evalsha"
            | b"watch"
            | b"unwatch"
            | b"multi"
            | b"exec"
            | b"discard"
    )
}

/// Commands whose extra arguments name additional keys; with more than one
/// key the command could straddle shards.
fn multi_key(name: &[u8]) -> bool {
    matches!(
        name,
        b"mget"
            | b"mset"
            | b"msetnx"
            | b"del"
            | b"unlink"
            | b"exists"
            | b"touch"
            | b"sdiff"
            | b"sdiffstore"
            | b"sinter"
            | b"sinterstore"
            | b"sunion"
            | b"sunionstore"
            | b"pfcount"
            | b"pfmerge"
            | b"rename"
            | b"renamenx"
            | b"rpoplpush"
            | b"smove"
            | b"lmove"
            | b"zdiffstore"
            | b"zinterstore"
            | b"zunionstore"
            | b"copy"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> Result<Option<CommandFrame>> {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::from(input);
        codec.decode(&mut buf)
    }

    fn frame(input: &[u8]) -> CommandFrame {
        decode_one(input).unwrap().unwrap()
    }

    #[test]
    fn decodes_complete_commands_verbatim() {
        let get = frame(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
        assert_eq!(get.name(), b"get");
        assert_eq!(get.arg_count(), 2);
        assert_eq!(get.first_arg(), Some(&b"a"[..]));
        assert_eq!(get.buffer(), b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");

        let info = frame(b"*1\r\n$4\r\niNfo\r\n");
        assert_eq!(info.name(), b"info");
        assert_eq!(info.first_arg(), None);
    }

    #[test]
    fn leaves_trailing_bytes_for_the_next_frame() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nQUIT\r\n"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.name(), b"ping");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.name(), b"quit");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frames() {
        for partial in [
            &b"*2\r\n$3\r\nget\r\n"[..],
            &b"*1\r\n$4\r\ninf"[..],
            &b"*1\r\n$4"[..],
            &b"*2"[..],
        ] {
            assert!(decode_one(partial).unwrap().is_none(), "{partial:?}");
        }
    }

    #[test]
    fn rejects_malformed_commands() {
        for bad in [
            // inline commands are not accepted
            &b"info\r\n"[..],
            &b"*a\r\n"[..],
            &b"*0\r\n"[..],
            &b"*-1\r\n"[..],
            &b"*1\r\n$a\r\n"[..],
            &b"*1\r\n$-1\r\n"[..],
            // declared length shorter than the payload
            &b"*1\r\n$1\r\naa\r\n"[..],
            // non-bulk top-level element
            &b"*2\r\n$3\r\nget\r\n:1\r\n"[..],
        ] {
            assert!(
                matches!(decode_one(bad), Err(Error::Protocol)),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn intercepts_and_forwards_without_multiplexing() {
        assert_eq!(
            classify(&frame(b"*1\r\n$4\r\nPING\r\n"), false),
            Disposition::Pong
        );
        assert_eq!(
            classify(&frame(b"*1\r\n$4\r\nQUIT\r\n"), false),
            Disposition::Quit
        );
        assert_eq!(
            classify(&frame(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n"), false),
            Disposition::Select
        );
        assert_eq!(
            classify(&frame(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"), false),
            Disposition::Forward
        );
        assert_eq!(
            classify(&frame(b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n"), false),
            Disposition::Forward
        );
        assert_eq!(
            classify(&frame(b"*1\r\n$5\r\nMULTI\r\n"), false),
            Disposition::Transaction
        );
        assert_eq!(
            classify(&frame(b"*2\r\n$5\r\nWATCH\r\n$1\r\nk\r\n"), false),
            Disposition::Transaction
        );
    }

    #[test]
    fn denies_single_client_commands_everywhere() {
        for cmd in [
            &b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n"[..],
            &b"*1\r\n$7\r\nMONITOR\r\n"[..],
            &b"*3\r\n$5\r\nBLPOP\r\n$1\r\nk\r\n$1\r\n0\r\n"[..],
            &b"*2\r\n$7\r\nCLUSTER\r\n$4\r\ninfo\r\n"[..],
        ] {
            assert_eq!(classify(&frame(cmd), false), Disposition::Unsupported);
            assert_eq!(classify(&frame(cmd), true), Disposition::Unsupported);
        }
    }

    #[test]
    fn multiplexing_denies_multi_key_and_keyspace_commands() {
        let mget_two = frame(b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n");
        assert_eq!(classify(&mget_two, true), Disposition::Unsupported);

        // A single key still routes.
        let mget_one = frame(b"*2\r\n$4\r\nMGET\r\n$1\r\na\r\n");
        assert_eq!(classify(&mget_one, true), Disposition::Forward);

        let keys = frame(b"*2\r\n$4\r\nKEYS\r\n$1\r\n*\r\n");
        assert_eq!(classify(&keys, true), Disposition::Unsupported);
        let flushdb = frame(b"*1\r\n$7\r\nFLUSHDB\r\n");
        assert_eq!(classify(&flushdb, true), Disposition::Unsupported);

        // Transactions cannot span shards.
        let multi = frame(b"*1\r\n$5\r\nMULTI\r\n");
        assert_eq!(classify(&multi, true), Disposition::Unsupported);
    }
}
