//! Minimal STOMP 1.x text-frame codec over a byte stream.
//!
//! No `stomp` crate exists anywhere in the reference pack, so this is
//! hand-rolled; the shape (an explicit `Frame` struct, a `parse`/`encode`
//! pair, frames delimited by a NUL byte) mirrors the STOMP 1.2 spec
//! directly rather than any one client library.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Frame {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.push(b':');
            out.extend_from_slice(v.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0u8);
        out
    }

    /// Parse exactly one frame out of the front of `buf`. Returns the
    /// parsed frame and how many bytes were consumed, or `None` if `buf`
    /// doesn't yet contain a complete (NUL-terminated) frame.
    pub fn parse(buf: &[u8]) -> Option<(Frame, usize)> {
        // Leading newlines between frames are STOMP heartbeats; skip them.
        let mut start = 0;
        while start < buf.len() && buf[start] == b'\n' {
            start += 1;
        }
        let nul_pos = buf[start..].iter().position(|&b| b == 0)?;
        let frame_bytes = &buf[start..start + nul_pos];

        let text = String::from_utf8_lossy(frame_bytes);
        let mut lines = text.splitn(2, '\n');
        let command = lines.next().unwrap_or("").to_string();
        let rest = lines.next().unwrap_or("");

        let mut headers = Vec::new();
        let mut body_start_in_rest = rest.len();
        for (idx, line) in rest.split('\n').enumerate() {
            if line.is_empty() {
                // Blank line ends the header block; compute offset.
                body_start_in_rest = rest
                    .splitn(idx + 2, '\n')
                    .take(idx + 1)
                    .map(|s| s.len() + 1)
                    .sum();
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                headers.push((k.to_string(), v.to_string()));
            }
        }
        let body = rest
            .as_bytes()
            .get(body_start_in_rest..)
            .unwrap_or(&[])
            .to_vec();

        Some((
            Frame {
                command,
                headers,
                body,
            },
            start + nul_pos + 1,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_parse_round_trips() {
        let frame = Frame::new("SEND")
            .header("destination", "/queue/test")
            .header("receipt", "abc123")
            .body(b"hello world".to_vec());
        let encoded = frame.encode();
        let (parsed, consumed) = Frame::parse(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed.command, "SEND");
        assert_eq!(parsed.get("destination"), Some("/queue/test"));
        assert_eq!(parsed.get("receipt"), Some("abc123"));
        assert_eq!(parsed.body, b"hello world");
    }

    #[test]
    fn parse_handles_empty_body() {
        let frame = Frame::new("CONNECTED").header("version", "1.2");
        let encoded = frame.encode();
        let (parsed, _) = Frame::parse(&encoded).unwrap();
        assert_eq!(parsed.body, Vec::<u8>::new());
    }

    #[test]
    fn parse_returns_none_on_incomplete_buffer() {
        let frame = Frame::new("SEND").body(b"partial".to_vec());
        let mut encoded = frame.encode();
        encoded.pop(); // drop the trailing NUL
        assert!(Frame::parse(&encoded).is_none());
    }

    #[test]
    fn parse_skips_heartbeat_newlines_between_frames() {
        let mut buf = vec![b'\n', b'\n'];
        buf.extend_from_slice(&Frame::new("MESSAGE").encode());
        let (parsed, consumed) = Frame::parse(&buf).unwrap();
        assert_eq!(parsed.command, "MESSAGE");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn multiple_frames_parse_sequentially() {
        let mut buf = Frame::new("CONNECTED").encode();
        buf.extend_from_slice(&Frame::new("RECEIPT").header("receipt-id", "1").encode());
        let (first, consumed1) = Frame::parse(&buf).unwrap();
        assert_eq!(first.command, "CONNECTED");
        let (second, _consumed2) = Frame::parse(&buf[consumed1..]).unwrap();
        assert_eq!(second.command, "RECEIPT");
        assert_eq!(second.get("receipt-id"), Some("1"));
    }
}
