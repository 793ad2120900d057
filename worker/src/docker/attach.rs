//! This module implements the hijacked side of the Engine API: stdio
//! attachments over an HTTP/1.1 connection upgrade, and the decoder for
//! the daemon's stream multiplexing.
//!

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use super::{Error, ErrorKind, Result, ResultExt};

/// Upper bound on the upgrade response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Which stdio stream of the container to attach.
#[derive(Clone, Copy, Debug)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr
}

impl Stream {
    /// Query string selecting this stream on the attach endpoint.
    fn query(&self) -> &'static str {
        match self {
            Stream::Stdin => "stream=1&stdin=1",
            Stream::Stdout => "stream=1&stdout=1",
            Stream::Stderr => "stream=1&stderr=1"
        }
    }
}

/// Open an upgraded attach connection for one stream of the container.
///
/// Once this function returns, the attachment is live: output produced
/// after this point is guaranteed to be observed, which is what the
/// executor's attach-before-start ordering relies on.
pub fn open(addr: &str, container: &str, stream: Stream) -> Result<TcpStream> {
    let mut tcp = TcpStream::connect(addr)
        .chain_err(|| ErrorKind::Upgrade(format!("cannot connect to {}", addr)))
        ?;

    let request = format!(
        "POST /containers/{}/attach?{} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: tcp\r\n\
         Content-Length: 0\r\n\
         \r\n",
        container, stream.query(), addr);
    tcp.write_all(request.as_bytes())?;

    // Consume the response head byte by byte so no stream payload is read
    // past the blank line.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(Error::from(ErrorKind::Upgrade(
                "oversized response head".to_owned())));
        }
        if tcp.read(&mut byte)? == 0 {
            return Err(Error::from(ErrorKind::Upgrade(
                "connection closed before the upgrade completed".to_owned())));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    // 101 on a proper upgrade; older daemons answer the attach with 200.
    if !status_line.contains(" 101 ") && !status_line.contains(" 200 ") {
        return Err(Error::from(ErrorKind::Upgrade(
            format!("daemon refused the attach: {}", status_line))));
    }

    Ok(tcp)
}

/// Attached container stdin.
///
/// Dropping the handle half-closes the connection so the program inside
/// the container observes EOF, then releases it entirely.
pub struct AttachInput {
    stream: TcpStream
}

impl AttachInput {
    /// Wrap an upgraded attach connection.
    pub fn new(stream: TcpStream) -> AttachInput {
        AttachInput { stream }
    }
}

impl Write for AttachInput {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.stream.write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for AttachInput {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

/// Decoder for the daemon's stream multiplexing.
///
/// A TTY-less container's output arrives in frames of an 8-byte header
/// `[stream_type, 0, 0, 0, len_be32]` followed by `len` payload bytes;
/// this reader yields the payload bytes only.
pub struct StreamDemuxer<R> {
    inner: R,

    /// Payload bytes remaining in the current frame.
    remaining: usize
}

impl<R> StreamDemuxer<R>
    where R: Read {
    /// Wrap a multiplexed stream.
    pub fn new(inner: R) -> StreamDemuxer<R> {
        StreamDemuxer {
            inner,
            remaining: 0
        }
    }
}

impl<R> Read for StreamDemuxer<R>
    where R: Read {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.remaining == 0 {
            let mut header = [0u8; 8];
            if !fill_or_eof(&mut self.inner, &mut header)? {
                return Ok(0);
            }
            self.remaining = u32::from_be_bytes(
                [header[4], header[5], header[6], header[7]]) as usize;
        }

        let take = std::cmp::min(buf.len(), self.remaining);
        let read = self.inner.read(&mut buf[..take])?;
        if read == 0 {
            // The stream ended inside a frame; report EOF rather than spin.
            return Ok(0);
        }
        self.remaining -= read;
        Ok(read)
    }
}

/// Fill `buf` entirely, or report a clean EOF if the stream ends on a
/// frame boundary.
fn fill_or_eof<R>(inner: &mut R, buf: &mut [u8]) -> std::io::Result<bool>
    where R: Read {
    let mut filled = 0;
    while filled < buf.len() {
        let read = inner.read(&mut buf[filled..])?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream multiplexing header truncated"));
        }
        filled += read;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![stream_type, 0, 0, 0];
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn demuxes_consecutive_frames() {
        let mut raw = frame(1, b"hello ");
        raw.extend(frame(1, b"world"));

        let mut demuxer = StreamDemuxer::new(Cursor::new(raw));
        let mut decoded = String::new();
        demuxer.read_to_string(&mut decoded).unwrap();
        assert_eq!("hello world", decoded);
    }

    #[test]
    fn empty_frames_are_skipped() {
        let mut raw = frame(1, b"");
        raw.extend(frame(1, b"x"));
        raw.extend(frame(1, b""));

        let mut demuxer = StreamDemuxer::new(Cursor::new(raw));
        let mut decoded = Vec::new();
        demuxer.read_to_end(&mut decoded).unwrap();
        assert_eq!(b"x".to_vec(), decoded);
    }

    #[test]
    fn clean_eof_between_frames() {
        let raw = frame(2, b"diag");
        let mut demuxer = StreamDemuxer::new(Cursor::new(raw));
        let mut decoded = Vec::new();
        demuxer.read_to_end(&mut decoded).unwrap();
        assert_eq!(b"diag".to_vec(), decoded);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let raw = vec![1u8, 0, 0];
        let mut demuxer = StreamDemuxer::new(Cursor::new(raw));
        let mut decoded = Vec::new();
        assert!(demuxer.read_to_end(&mut decoded).is_err());
    }

    #[test]
    fn large_frames_stream_through_partial_reads() {
        let payload = vec![0xabu8; 100_000];
        let raw = frame(1, &payload);

        let mut demuxer = StreamDemuxer::new(Cursor::new(raw));
        let mut decoded = Vec::new();
        demuxer.read_to_end(&mut decoded).unwrap();
        assert_eq!(payload, decoded);
    }
}
