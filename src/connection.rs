use std::io::{self, Cursor};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::frame::{self, Frame};

/// A TCP stream framed with the wire protocol.
///
/// Reads go through an internal `BytesMut` buffer so a command split
/// across arbitrary TCP chunks is reassembled before it is decoded; a
/// partial command is left in the buffer untouched until more bytes
/// arrive. Writes are buffered and flushed per frame.
///
/// The connection also keeps a running count of every framed byte it has
/// consumed (CRLF terminators included). On a replication channel that
/// count is what a `REPLCONF GETACK` answer reports, snapshotted just
/// before each command is read.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,

    read_total: u64,
    read_total_at_previous_command: u64,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
            read_total: 0,
            read_total_at_previous_command: 0,
        }
    }

    /// Reads one whole frame, waiting for more socket data as long as the
    /// buffered bytes only form a prefix of it. Returns `None` on a clean
    /// peer shutdown.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, crate::Error> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // read_buf returns the number of bytes that were read from the
            // TCP stream and appended to self.buffer
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err("connection reset by peer".into());
                }
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, crate::Error> {
        use frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;

                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                self.buffer.advance(len);
                self.read_total += len as u64;

                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(frame::Error::Other(err)) => Err(err),
        }
    }

    /// Reads one CRLF-terminated line and returns it without the
    /// terminator. Used for the handshake replies that are not followed by
    /// a decodable frame (`+FULLRESYNC ...`, the `$<len>` snapshot header).
    pub async fn read_line(&mut self) -> Result<String, crate::Error> {
        loop {
            if let Some(at) = find_crlf(&self.buffer) {
                let line = self.buffer.split_to(at);
                self.buffer.advance(2);
                self.read_total += at as u64 + 2;

                return String::from_utf8(line.to_vec())
                    .map_err(|_| "protocol error; line is not valid utf-8".into());
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err("connection reset by peer".into());
            }
        }
    }

    /// Reads exactly `n` raw bytes. The snapshot payload arrives this way:
    /// it has no trailing CRLF, so it can never be decoded as a bulk frame.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, crate::Error> {
        while self.buffer.len() < n {
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err("connection reset by peer".into());
            }
        }

        self.read_total += n as u64;

        Ok(self.buffer.split_to(n).freeze())
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Array(val) => {
                self.stream.write_u8(b'*').await?;
                self.write_decimal(val.len() as u64).await?;

                for entry in val {
                    self.write_value(entry).await?;
                }
            }
            _ => {
                self.write_value(frame).await?;
            }
        }

        self.stream.flush().await
    }

    async fn write_value(&mut self, frame: &Frame) -> io::Result<()> {
        match frame {
            Frame::Bulk(val) => {
                let len = val.len();

                self.stream.write_u8(b'$').await?;
                self.write_decimal(len as u64).await?;
                self.stream.write_all(val).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Simple(string) => {
                self.stream.write_u8(b'+').await?;
                self.stream.write_all(string.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Error(string) => {
                self.stream.write_u8(b'-').await?;
                self.stream.write_all(string.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            Frame::Integer(val) => {
                self.stream.write_u8(b':').await?;
                self.write_decimal(*val).await?;
            }
            Frame::Null => {
                self.stream.write_all(b"$-1\r\n").await?;
            }
            // Commands and replies never nest arrays.
            Frame::Array(_) => unreachable!(),
        }

        Ok(())
    }

    async fn write_decimal(&mut self, val: u64) -> io::Result<()> {
        use std::io::Write;

        // Convert the value to a string
        let mut buf = [0u8; 20];
        let mut buf = Cursor::new(&mut buf[..]);
        write!(&mut buf, "{}", val)?;

        let pos = buf.position() as usize;
        self.stream.write_all(&buf.get_ref()[..pos]).await?;
        self.stream.write_all(b"\r\n").await?;

        Ok(())
    }

    /// Writes raw bytes and flushes. The snapshot transfer needs this: its
    /// payload is sent without a frame terminator.
    pub async fn write_all(&mut self, src: &[u8]) -> io::Result<()> {
        self.stream.write_all(src).await?;
        self.stream.flush().await
    }

    /// Encodes `parts` as an array of bulk strings and writes it. This is
    /// the shape every command takes on the wire, both for the handshake
    /// and for replaying mutations to secondaries.
    pub async fn send_command<S: AsRef<str>>(&mut self, parts: &[S]) -> io::Result<()> {
        let mut frame = Frame::array();

        for part in parts {
            frame.push_bulk(Bytes::copy_from_slice(part.as_ref().as_bytes()));
        }

        self.write_frame(&frame).await
    }

    /// Total framed bytes consumed since the counters were last reset.
    pub fn bytes_read(&self) -> u64 {
        self.read_total
    }

    /// The byte count snapshotted before the command currently being
    /// handled was read. A GETACK answers with this value so the ack never
    /// includes the GETACK command itself.
    pub fn bytes_read_at_previous_command(&self) -> u64 {
        self.read_total_at_previous_command
    }

    pub fn remember_previous_bytes(&mut self) {
        self.read_total_at_previous_command = self.read_total;
    }

    /// Zeroes both counters. A secondary calls this after discarding the
    /// snapshot so ack offsets cover replicated commands only.
    pub fn reset_byte_counts(&mut self) {
        self.read_total = 0;
        self.read_total_at_previous_command = 0;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
