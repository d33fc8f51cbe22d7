//! Just enough HTTP for an MJPEG stream
//!
//! Every request gets the stream, so the request head is read only to drain
//! it and to log what the client asked for.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Multipart boundary announced in the response head
pub const BOUNDARY: &str = "--frame";

/// Response head sent once per connection before the first part
pub const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: multipart/x-mixed-replace; boundary=--frame\r\n\
Cache-Control: no-cache, no-store, must-revalidate\r\n\
Pragma: no-cache\r\n\
Connection: close\r\n\
\r\n";

/// Request line of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
}

/// A reader whose blocking reads can be bounded
pub trait TimedRead: Read {
    fn set_read_limit(&mut self, timeout: Duration) -> io::Result<()>;
}

impl TimedRead for TcpStream {
    fn set_read_limit(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }
}

/// Reads until the blank line ending the request head.
///
/// `timeout` bounds the whole head, not each read: a peer sending one byte
/// at a time still fails with `TimedOut` once it runs out. Fails with
/// `UnexpectedEof` if the peer closes first and `InvalidData` if the head
/// exceeds `max_bytes`. Bytes after the head are discarded.
pub fn read_request_head<R: TimedRead>(
    reader: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> io::Result<RequestHead> {
    let deadline = Instant::now() + timeout;
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "request head not received in time",
            ));
        }
        reader.set_read_limit(remaining)?;

        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            // Unix reports an expired read timeout as WouldBlock
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, e));
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        head.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&head) {
            head.truncate(end);
            break;
        }
        if head.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }

    let text = String::from_utf8_lossy(&head);
    let mut parts = text.lines().next().unwrap_or_default().split_whitespace();
    Ok(RequestHead {
        method: parts.next().unwrap_or_default().to_string(),
        path: parts.next().unwrap_or("/").to_string(),
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Formats the header of one multipart part for a JPEG of `len` bytes.
pub fn part_header(len: usize) -> String {
    format!("\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

/// Writes one complete part (header + JPEG) and flushes.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<usize> {
    let header = part_header(jpeg.len());
    out.write_all(header.as_bytes())?;
    out.write_all(jpeg)?;
    out.flush()?;
    Ok(header.len() + jpeg.len())
}
