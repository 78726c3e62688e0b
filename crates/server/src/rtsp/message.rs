use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};

/// Magic byte prefixing interleaved binary frames (RFC 2326 §10.12).
const INTERLEAVED_MAGIC: u8 = b'$';

/// Maximum accepted size for a request/response body (SDP is tiny).
const MAX_BODY_LEN: usize = 64 * 1024;

/// An RTP/RTCP frame carried inline on the RTSP control connection.
///
/// Even channels carry RTP, odd channels the matching RTCP.
#[derive(Debug, Clone)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// A parsed RTSP request (RFC 2326 §6).
#[derive(Debug)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs; lookups are case-insensitive.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// CSeq header value; every request carries one, responses echo it.
    pub fn cseq(&self) -> &str {
        self.header("CSeq").unwrap_or("0")
    }

    /// Serialize to the wire format (client side).
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
            out.push_str("\r\n");
            out.push_str(&String::from_utf8_lossy(&self.body));
        } else {
            out.push_str("\r\n");
        }
        out
    }
}

/// An RTSP response (RFC 2326 §7), builder-style.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 461 — the requested transport is not supported (RFC 2326 §11.3.3).
    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the wire format. `Content-Length` is appended
    /// automatically when a body is present.
    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(body) = &self.body {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
            out.push_str("\r\n");
            out.push_str(body);
        } else {
            out.push_str("\r\n");
        }
        out
    }
}

/// Anything that can arrive on an RTSP connection.
#[derive(Debug)]
pub enum RtspMessage {
    Request(RtspRequest),
    Response(RtspResponse),
    Interleaved(InterleavedFrame),
}

/// Read one message from the connection. `Ok(None)` is clean EOF.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<RtspMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let first = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if first == INTERLEAVED_MAGIC {
        let channel = reader.read_u8().await?;
        let len = reader.read_u16().await? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(RtspMessage::Interleaved(InterleavedFrame {
            channel,
            payload: Bytes::from(payload),
        })));
    }

    // Text message: re-attach the consumed byte to the start line.
    let mut start = vec![first];
    reader.read_until(b'\n', &mut start).await?;
    let start_line = String::from_utf8_lossy(&start).trim_end().to_string();
    if start_line.is_empty() {
        return Err(RelayError::Transient("empty RTSP start line".to_string()));
    }

    let mut headers = Vec::new();
    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(RelayError::Transient(
                "connection closed mid-message".to_string(),
            ));
        }
        let line = String::from_utf8_lossy(&line).trim_end().to_string();
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.find(':') else {
            return Err(RelayError::Transient(format!(
                "malformed RTSP header: {line}"
            )));
        };
        let name = line[..colon].trim().to_string();
        let value = line[colon + 1..].trim().to_string();
        headers.push((name, value));
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_LEN {
        return Err(RelayError::Transient(format!(
            "RTSP body too large: {content_length}"
        )));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    if let Some(rest) = start_line.strip_prefix("RTSP/1.0 ") {
        // response: RTSP/1.0 <code> <reason>
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status_code = code.parse::<u16>().map_err(|_| {
            RelayError::Transient(format!("malformed RTSP status line: {start_line}"))
        })?;
        let mut resp = RtspResponse::new(status_code, reason);
        resp.headers = headers;
        if !body.is_empty() {
            resp.body = Some(String::from_utf8_lossy(&body).into_owned());
        }
        return Ok(Some(RtspMessage::Response(resp)));
    }

    // request: <method> <uri> <version>
    let parts: Vec<&str> = start_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(RelayError::Transient(format!(
            "malformed RTSP request line: {start_line}"
        )));
    }
    Ok(Some(RtspMessage::Request(RtspRequest {
        method: parts[0].to_string(),
        uri: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        body,
    })))
}

/// Write an interleaved frame: `$ <channel> <len:u16> <payload>`.
pub async fn write_interleaved<W>(writer: &mut W, frame: &InterleavedFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    header[0] = INTERLEAVED_MAGIC;
    header[1] = frame.channel;
    header[2..4].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}
