use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;
use std::{fmt, str::Utf8Error};

use bytes::{Buf, Bytes};

/// A single frame of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),    // +
    Error(String),     // -
    Integer(u64),      // :
    Bulk(Bytes),       // $
    Null,              // $-1
    Array(Vec<Frame>), // *
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data has been buffered to decode a whole frame.
    /// The caller waits for more bytes instead of failing the connection.
    Incomplete,
    Other(crate::Error),
}

impl Frame {
    pub fn array() -> Frame {
        Frame::Array(vec![])
    }

    pub fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::Bulk(bytes));
            }
            _ => panic!("Not an array frame"),
        }
    }

    /// Validates that a whole frame can be decoded from `src` without
    /// materializing it. On success the cursor sits one past the frame,
    /// so the caller knows how many buffered bytes the frame spans.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_descriptor(src)? {
            // error
            b'-' => {
                get_line(src)?;
                Ok(())
            }
            // simple
            b'+' => {
                get_line(src)?;
                Ok(())
            }
            // integer
            b':' => {
                get_decimal(src)?;
                Ok(())
            }
            // bulk
            b'$' => {
                if peek_u8(src)? == b'-' {
                    // nil bulk: "$-1\r\n"
                    skip(src, 4)
                } else {
                    let len = get_decimal(src)? as usize;

                    // skip that number of bytes + 2 (\r\n).
                    skip(src, len + 2)
                }
            }
            // array
            b'*' => {
                let len = get_decimal(src)?;

                for _ in 0..len {
                    Frame::check(src)?;
                }

                Ok(())
            }
            descriptor => Err(format!(
                "protocol error; invalid frame type byte {:?}",
                char::from(descriptor)
            )
            .into()),
        }
    }

    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_descriptor(src)? {
            b'-' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Error(string))
            }
            b'+' => {
                let bytes_vec = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes_vec)?;

                Ok(Frame::Simple(string))
            }
            b':' => {
                let value = get_decimal(src)?;

                Ok(Frame::Integer(value))
            }
            b'$' => {
                if peek_u8(src)? == b'-' {
                    let line = get_line(src)?;

                    if line != b"-1" {
                        return Err("protocol error; invalid bulk length".into());
                    }

                    return Ok(Frame::Null);
                }

                let len = get_decimal(src)? as usize;
                let n = len + 2;

                if src.remaining() < n {
                    return Err(Error::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..len]);

                if &src.chunk()[len..n] != b"\r\n" {
                    return Err("protocol error; bulk payload not terminated".into());
                }

                // skip payload + terminator.
                skip(src, n)?;

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let len = get_decimal(src)?;
                let mut array: Vec<Frame> = Vec::with_capacity(len as usize);

                for _ in 0..len {
                    array.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(array))
            }
            descriptor => Err(format!(
                "protocol error; invalid frame type byte {:?}",
                char::from(descriptor)
            )
            .into()),
        }
    }
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<u64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// A "line" refers to a sequence of bytes that is terminated by a carriage return
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;

    let end = match src.get_ref().len() {
        0 => return Err(Error::Incomplete),
        len => len - 1,
    };

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);

            return Ok(&src.get_ref()[start..i]);
        }
    }

    Err(Error::Incomplete)
}

fn get_descriptor(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.chunk()[0])
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<Utf8Error> for Error {
    fn from(_src: Utf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Other(err) => err.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(input);
        Frame::check(&mut cursor)?;

        let consumed = cursor.position() as usize;
        assert_eq!(consumed, input.len(), "frame did not span whole input");

        cursor.set_position(0);
        Frame::parse(&mut cursor)
    }

    #[test]
    fn parse_simple_string() {
        let frame = parse_all(b"+PONG\r\n").unwrap();
        assert_eq!(frame, Frame::Simple("PONG".to_string()));
    }

    #[test]
    fn parse_error() {
        let frame = parse_all(b"-ERR something\r\n").unwrap();
        assert_eq!(frame, Frame::Error("ERR something".to_string()));
    }

    #[test]
    fn parse_integer() {
        let frame = parse_all(b":42\r\n").unwrap();
        assert_eq!(frame, Frame::Integer(42));
    }

    #[test]
    fn parse_bulk() {
        let frame = parse_all(b"$3\r\nhey\r\n").unwrap();
        assert_eq!(frame, Frame::Bulk(Bytes::from_static(b"hey")));
    }

    #[test]
    fn parse_nil_bulk() {
        let frame = parse_all(b"$-1\r\n").unwrap();
        assert_eq!(frame, Frame::Null);
    }

    #[test]
    fn parse_command_array() {
        let frame = parse_all(b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n").unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"ECHO")),
                Frame::Bulk(Bytes::from_static(b"hey")),
            ])
        );
    }

    #[test]
    fn incomplete_input_is_not_an_error() {
        // Every proper prefix of a command must report Incomplete so the
        // connection keeps buffering instead of failing.
        let full = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";

        for cut in 1..full.len() {
            let mut cursor = Cursor::new(&full[..cut]);
            match Frame::check(&mut cursor) {
                Err(Error::Incomplete) => {}
                other => panic!("prefix of {} bytes produced {:?}", cut, other.err()),
            }
        }
    }

    #[test]
    fn missing_bulk_terminator_is_a_protocol_error() {
        let mut cursor = Cursor::new(&b"$3\r\nheyXX"[..]);
        assert!(Frame::check(&mut cursor).is_ok());

        cursor.set_position(0);
        match Frame::parse(&mut cursor) {
            Err(Error::Other(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_descriptor_is_a_protocol_error() {
        let mut cursor = Cursor::new(&b"@oops\r\n"[..]);
        match Frame::check(&mut cursor) {
            Err(Error::Other(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.err()),
        }
    }
}
