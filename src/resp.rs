//! RESP 2.0 parser and reply encoder.
//!
//! A pure, reentrant decoder from a contiguous byte buffer into a
//! [`ParseItem`]. Unlike a streaming parser, this assumes the buffer
//! already holds one complete frame, so there is no `Incomplete` variant.
//! No network I/O happens here.

use bytes::BytesMut;
use std::fmt;

/// A decoded RESP value.
///
/// `String` covers both the simple-string (`+`) and bulk-string (`$`)
/// wire encodings; the distinction doesn't survive parsing. It borrows
/// from the input buffer, so a `ParseItem` must not outlive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseItem<'a> {
    String(&'a [u8]),
    Integer(i64),
    List(Vec<ParseItem<'a>>),
}

/// Parse failure: malformed bytes, a truncated frame, or an unrecognized
/// leading byte. Error frames (`-`) are not accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInput(pub &'static str);

impl fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid RESP input: {}", self.0)
    }
}

impl std::error::Error for InvalidInput {}

/// Parse one complete RESP frame from `buf`, returning the decoded item
/// and the number of bytes consumed.
pub fn parse(buf: &[u8]) -> Result<(ParseItem<'_>, usize), InvalidInput> {
    if buf.is_empty() {
        return Err(InvalidInput("empty buffer"));
    }

    match buf[0] {
        b'+' => parse_simple_string(buf),
        b'$' => parse_bulk_string(buf),
        b'*' => parse_array(buf),
        b':' => parse_integer(buf),
        _ => Err(InvalidInput("unknown type prefix")),
    }
}

/// Find the first CRLF in `buf`, returning the index of the `\r`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    (0..=buf.len() - 2).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

fn parse_simple_string(buf: &[u8]) -> Result<(ParseItem<'_>, usize), InvalidInput> {
    let end = find_crlf(&buf[1..]).ok_or(InvalidInput("simple string missing CRLF"))?;
    Ok((ParseItem::String(&buf[1..1 + end]), 1 + end + 2))
}

fn parse_decimal_line(buf: &[u8]) -> Result<(i64, usize), InvalidInput> {
    let end = find_crlf(&buf[1..]).ok_or(InvalidInput("length/integer missing CRLF"))?;
    let line = &buf[1..1 + end];

    let (negative, digits) = match line.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, line),
    };

    if digits.is_empty() {
        return Err(InvalidInput("empty decimal"));
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(InvalidInput("non-digit in decimal"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(InvalidInput("decimal overflow"))?;
    }

    Ok((if negative { -value } else { value }, 1 + end + 2))
}

fn parse_integer(buf: &[u8]) -> Result<(ParseItem<'_>, usize), InvalidInput> {
    let (value, consumed) = parse_decimal_line(buf)?;
    Ok((ParseItem::Integer(value), consumed))
}

fn parse_bulk_string(buf: &[u8]) -> Result<(ParseItem<'_>, usize), InvalidInput> {
    let (len, header_len) = parse_decimal_line(buf)?;
    if len < 0 {
        return Err(InvalidInput("negative bulk string length"));
    }
    let len = len as usize;

    let data_start = header_len;
    let data_end = data_start
        .checked_add(len)
        .ok_or(InvalidInput("bulk string length overflow"))?;
    let total = data_end
        .checked_add(2)
        .ok_or(InvalidInput("bulk string length overflow"))?;

    if buf.len() < total {
        return Err(InvalidInput("bulk string truncated"));
    }
    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(InvalidInput("bulk string missing trailing CRLF"));
    }

    Ok((ParseItem::String(&buf[data_start..data_end]), total))
}

fn parse_array(buf: &[u8]) -> Result<(ParseItem<'_>, usize), InvalidInput> {
    let (count, header_len) = parse_decimal_line(buf)?;
    if count < 0 {
        return Err(InvalidInput("negative array length"));
    }
    let count = count as usize;

    let mut offset = header_len;
    let mut items = Vec::with_capacity(count);

    for _ in 0..count {
        if offset >= buf.len() {
            return Err(InvalidInput("array truncated"));
        }
        let (item, consumed) = parse(&buf[offset..])?;
        items.push(item);
        offset += consumed;
    }

    Ok((ParseItem::List(items), offset))
}

/// Encode a simple string reply: `+<s>\r\n`.
pub fn encode_simple(out: &mut BytesMut, s: &[u8]) {
    out.extend_from_slice(b"+");
    out.extend_from_slice(s);
    out.extend_from_slice(b"\r\n");
}

/// Encode a server-originated RESP error: `-<msg>\r\n`. The parser never
/// produces these from client input; they're only sent back to a client
/// whose own frame failed to parse.
pub fn encode_error(out: &mut BytesMut, msg: &str) {
    out.extend_from_slice(b"-");
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Encode an integer reply: `:<n>\r\n`.
pub fn encode_integer(out: &mut BytesMut, n: i64) {
    out.extend_from_slice(b":");
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Encode a bulk string reply: `$<len>\r\n<bytes>\r\n`.
pub fn encode_bulk(out: &mut BytesMut, data: &[u8]) {
    out.extend_from_slice(b"$");
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Encode a nil bulk string reply: `$-1\r\n`.
pub fn encode_nil(out: &mut BytesMut) {
    out.extend_from_slice(b"$-1\r\n");
}

/// Encode an empty array reply: `*0\r\n`.
pub fn encode_empty_array(out: &mut BytesMut) {
    out.extend_from_slice(b"*0\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_string_roundtrip() {
        let (item, consumed) = parse(b"+OK\r\n").unwrap();
        assert_eq!(item, ParseItem::String(b"OK"));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn simple_string_allows_embedded_non_cr_bytes() {
        let (item, _) = parse(b"+hello world\r\n").unwrap();
        assert_eq!(item, ParseItem::String(b"hello world"));
    }

    #[test]
    fn bulk_string_is_binary_transparent() {
        let (item, consumed) = parse(b"$5\r\nh\r\n\0l\r\n").unwrap();
        assert_eq!(item, ParseItem::String(b"h\r\n\0l"));
        assert_eq!(consumed, 11);
    }

    #[test]
    fn bulk_string_zero_length() {
        let (item, consumed) = parse(b"$0\r\n\r\n").unwrap();
        assert_eq!(item, ParseItem::String(b""));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn bulk_string_missing_trailing_crlf_is_invalid() {
        assert!(parse(b"$3\r\nfooXX").is_err());
    }

    #[test]
    fn integer_roundtrip() {
        let (item, consumed) = parse(b":1000\r\n").unwrap();
        assert_eq!(item, ParseItem::Integer(1000));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn negative_integer() {
        let (item, _) = parse(b":-42\r\n").unwrap();
        assert_eq!(item, ParseItem::Integer(-42));
    }

    #[test]
    fn integer_extremes() {
        let (item, _) = parse(b":9223372036854775807\r\n").unwrap();
        assert_eq!(item, ParseItem::Integer(i64::MAX));

        let (item, _) = parse(b":-9223372036854775808\r\n").unwrap();
        assert_eq!(item, ParseItem::Integer(i64::MIN));
    }

    #[test]
    fn array_of_bulk_strings() {
        let (item, consumed) = parse(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n").unwrap();
        assert_eq!(
            item,
            ParseItem::List(vec![ParseItem::String(b"foo"), ParseItem::String(b"bar")])
        );
        assert_eq!(consumed, 22);
    }

    #[test]
    fn empty_array() {
        let (item, consumed) = parse(b"*0\r\n").unwrap();
        assert_eq!(item, ParseItem::List(vec![]));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn nested_array() {
        let (item, _) = parse(b"*1\r\n*1\r\n:5\r\n").unwrap();
        assert_eq!(
            item,
            ParseItem::List(vec![ParseItem::List(vec![ParseItem::Integer(5)])])
        );
    }

    #[test]
    fn array_claiming_too_many_elements_is_invalid() {
        assert!(parse(b"*2\r\n$3\r\nfoo\r\n").is_err());
    }

    #[test]
    fn unknown_prefix_is_invalid() {
        assert!(parse(b"-ERR nope\r\n").is_err());
        assert!(parse(b"xyz\r\n").is_err());
    }

    #[test]
    fn truncating_a_frame_by_one_byte_is_invalid() {
        let frames: &[&[u8]] = &[b"+OK\r\n", b"$5\r\nhello\r\n", b":42\r\n", b"*1\r\n:1\r\n"];
        for frame in frames {
            let truncated = &frame[..frame.len() - 1];
            assert!(parse(truncated).is_err(), "expected error for {truncated:?}");
        }
    }

    #[test]
    fn encode_helpers_produce_expected_wire_bytes() {
        let mut out = BytesMut::new();
        encode_simple(&mut out, b"PONG");
        assert_eq!(&out[..], b"+PONG\r\n");

        let mut out = BytesMut::new();
        encode_bulk(&mut out, b"bar");
        assert_eq!(&out[..], b"$3\r\nbar\r\n");

        let mut out = BytesMut::new();
        encode_nil(&mut out);
        assert_eq!(&out[..], b"$-1\r\n");

        let mut out = BytesMut::new();
        encode_integer(&mut out, -7);
        assert_eq!(&out[..], b":-7\r\n");

        let mut out = BytesMut::new();
        encode_error(&mut out, "ERR bad");
        assert_eq!(&out[..], b"-ERR bad\r\n");

        let mut out = BytesMut::new();
        encode_empty_array(&mut out);
        assert_eq!(&out[..], b"*0\r\n");
    }
}
