use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::util::Unmarshal;

use crate::error::{RelayError, Result};
use crate::rtsp::message::{
    InterleavedFrame, RtspMessage, RtspRequest, RtspResponse, read_message,
};

/// How often and how long to retry DESCRIBE while the producer is still
/// announcing.
const DESCRIBE_ATTEMPTS: u32 = 10;
const DESCRIBE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Minimal RTSP 1.0 client for reading a relay stream over interleaved TCP.
pub struct RtspClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    base_url: String,
    cseq: u32,
    session: Option<String>,
}

impl RtspClient {
    pub async fn connect(rtsp_url: &str) -> Result<Self> {
        let (host, port) = parse_rtsp_url(rtsp_url)?;
        let socket = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| RelayError::Transient(format!("rtsp connect to {rtsp_url}: {e}")))?;
        let (read_half, write_half) = socket.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            base_url: rtsp_url.trim_end_matches('/').to_string(),
            cseq: 0,
            session: None,
        })
    }

    async fn request(
        &mut self,
        method: &str,
        uri: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<RtspResponse> {
        self.cseq += 1;
        let mut req = RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: "RTSP/1.0".to_string(),
            headers: vec![("CSeq".to_string(), self.cseq.to_string())],
            body: Vec::new(),
        };
        if let Some(session) = &self.session {
            req.headers.push(("Session".to_string(), session.clone()));
        }
        for (name, value) in extra_headers {
            req.headers.push((name.to_string(), value.to_string()));
        }
        self.writer.write_all(req.serialize().as_bytes()).await?;
        self.writer.flush().await?;

        // Interleaved data may already be in flight; skip it while waiting
        // for the matching response.
        loop {
            match read_message(&mut self.reader).await? {
                Some(RtspMessage::Response(resp)) => return Ok(resp),
                Some(RtspMessage::Interleaved(_)) => continue,
                Some(RtspMessage::Request(req)) => {
                    tracing::debug!(method = %req.method, "ignoring server-initiated request");
                    continue;
                }
                None => {
                    return Err(RelayError::Transient(
                        "rtsp server closed the connection".to_string(),
                    ));
                }
            }
        }
    }

    /// DESCRIBE with bounded retry: the producer may not have announced yet,
    /// in which case the relay answers 404 until it does.
    pub async fn describe_with_retry(&mut self) -> Result<String> {
        for attempt in 1..=DESCRIBE_ATTEMPTS {
            let url = self.base_url.clone();
            let resp = self
                .request("DESCRIBE", &url, &[("Accept", "application/sdp")])
                .await?;
            match resp.status_code {
                200 => {
                    return resp.body.ok_or_else(|| {
                        RelayError::Transient("DESCRIBE response had no SDP body".to_string())
                    });
                }
                404 => {
                    tracing::debug!(attempt, "stream not announced yet, retrying DESCRIBE");
                    tokio::time::sleep(DESCRIBE_RETRY_DELAY).await;
                }
                other => {
                    return Err(RelayError::Transient(format!(
                        "DESCRIBE failed with status {other}"
                    )));
                }
            }
        }
        Err(RelayError::NotFound(format!(
            "no publisher at {} after {DESCRIBE_ATTEMPTS} DESCRIBE attempts",
            self.base_url
        )))
    }

    /// SETUP every media in the SDP over interleaved TCP, channels `2i`/`2i+1`.
    /// Returns the number of medias set up.
    pub async fn setup_all(&mut self, sdp: &str) -> Result<usize> {
        let controls = media_controls(sdp);
        if controls.is_empty() {
            return Err(RelayError::Transient(
                "SDP advertises no media sections".to_string(),
            ));
        }

        for (index, control) in controls.iter().enumerate() {
            let url = setup_url(&self.base_url, control);
            let rtp_channel = (index * 2) as u8;
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_channel,
                rtp_channel + 1
            );
            let resp = self
                .request("SETUP", &url, &[("Transport", &transport)])
                .await?;
            if resp.status_code != 200 {
                return Err(RelayError::Transient(format!(
                    "SETUP {url} failed with status {}",
                    resp.status_code
                )));
            }
            if self.session.is_none()
                && let Some(session) = resp.header("Session")
            {
                // strip the ";timeout=..." suffix if present
                let id = session.split(';').next().unwrap_or(session).trim();
                self.session = Some(id.to_string());
            }
        }
        Ok(controls.len())
    }

    pub async fn play(&mut self) -> Result<()> {
        let url = self.base_url.clone();
        let resp = self
            .request("PLAY", &url, &[("Range", "npt=0.000-")])
            .await?;
        if resp.status_code != 200 {
            return Err(RelayError::Transient(format!(
                "PLAY failed with status {}",
                resp.status_code
            )));
        }
        Ok(())
    }

    /// Next interleaved frame. `Ok(None)` means the server closed the stream.
    pub async fn next_frame(&mut self) -> Result<Option<InterleavedFrame>> {
        loop {
            match read_message(&mut self.reader).await? {
                Some(RtspMessage::Interleaved(frame)) => return Ok(Some(frame)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

/// Connect to `rtsp_url`, set up all medias, and copy every incoming RTP
/// packet into `track` until the stream ends or `cancel` fires.
///
/// End of stream is not an error: the producer was killed or preempted and
/// the track simply goes silent.
pub async fn consume(
    rtsp_url: &str,
    track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut client = RtspClient::connect(rtsp_url).await?;
    let sdp = client.describe_with_retry().await?;
    let medias = client.setup_all(&sdp).await?;
    client.play().await?;
    tracing::info!(url = rtsp_url, medias, "rtsp consumer playing");

    let mut packets: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(url = rtsp_url, packets, "rtsp consumer cancelled");
                return Ok(());
            }
            frame = client.next_frame() => match frame? {
                Some(frame) => {
                    // odd channels carry RTCP, which the fan-out does not use
                    if frame.channel % 2 != 0 {
                        continue;
                    }
                    let mut buf = &frame.payload[..];
                    let packet = match Packet::unmarshal(&mut buf) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::debug!(url = rtsp_url, "dropping unparseable RTP packet: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = track.write_rtp(&packet).await {
                        tracing::debug!(url = rtsp_url, "track write failed: {e}");
                    }
                    packets += 1;
                }
                None => {
                    tracing::info!(url = rtsp_url, packets, "rtsp stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Pull `host` and `port` out of an `rtsp://host[:port][/path]` URL.
fn parse_rtsp_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("rtsp://")
        .ok_or_else(|| RelayError::BadRequest(format!("not an rtsp url: {url}")))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| RelayError::BadRequest(format!("bad rtsp port in {url}")))?;
            (host, port)
        }
        None => (authority, 554),
    };
    if host.is_empty() {
        return Err(RelayError::BadRequest(format!("no host in rtsp url: {url}")));
    }
    Ok((host.to_string(), port))
}

/// `a=control:` values for each `m=` section, falling back to the section
/// index when a media carries no control attribute.
fn media_controls(sdp: &str) -> Vec<String> {
    let mut controls = Vec::new();
    let mut in_media = false;
    for line in sdp.lines() {
        let line = line.trim_end();
        if line.starts_with("m=") {
            // default control for sections that never declare one
            controls.push(format!("streamid={}", controls.len()));
            in_media = true;
        } else if in_media
            && let Some(value) = line.strip_prefix("a=control:")
        {
            if let Some(last) = controls.last_mut() {
                *last = value.trim().to_string();
            }
        }
    }
    controls
}

fn setup_url(base: &str, control: &str) -> String {
    if control.starts_with("rtsp://") {
        control.to_string()
    } else if control == "*" {
        base.to_string()
    } else {
        format!("{base}/{control}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtsp::message::write_interleaved;
    use crate::rtsp::relay::RtspRelay;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn parse_urls() {
        assert_eq!(
            parse_rtsp_url("rtsp://localhost:8554").unwrap(),
            ("localhost".to_string(), 8554)
        );
        assert_eq!(
            parse_rtsp_url("rtsp://127.0.0.1:37201/stream").unwrap(),
            ("127.0.0.1".to_string(), 37201)
        );
        assert_eq!(
            parse_rtsp_url("rtsp://media.example.com").unwrap(),
            ("media.example.com".to_string(), 554)
        );
        assert!(parse_rtsp_url("http://localhost").is_err());
        assert!(parse_rtsp_url("rtsp://:8554").is_err());
    }

    #[test]
    fn controls_from_ffmpeg_style_sdp() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=No Name\r\n\
                   m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:streamid=0\r\n\
                   m=audio 0 RTP/AVP 97\r\na=rtpmap:97 MPEG4-GENERIC/44100/2\r\na=control:streamid=1\r\n";
        assert_eq!(media_controls(sdp), vec!["streamid=0", "streamid=1"]);
    }

    #[test]
    fn controls_default_when_missing() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\n";
        assert_eq!(media_controls(sdp), vec!["streamid=0"]);
    }

    #[test]
    fn setup_urls() {
        assert_eq!(
            setup_url("rtsp://h:1", "streamid=0"),
            "rtsp://h:1/streamid=0"
        );
        assert_eq!(setup_url("rtsp://h:1", "*"), "rtsp://h:1");
        assert_eq!(
            setup_url("rtsp://h:1", "rtsp://h:1/track0"),
            "rtsp://h:1/track0"
        );
    }

    const TEST_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Test\r\n\
                            m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:streamid=0\r\n";

    /// 12-byte RTP header (V=2, PT=96, seq=1, ts=1, ssrc=42) plus payload.
    fn rtp_packet_bytes() -> Bytes {
        let mut data = vec![
            0x80, 0x60, 0x00, 0x01, // V/P/X/CC, M/PT, sequence
            0x00, 0x00, 0x00, 0x01, // timestamp
            0x00, 0x00, 0x00, 0x2a, // ssrc
        ];
        data.extend_from_slice(b"nal");
        Bytes::from(data)
    }

    async fn publish_to(port: u16) -> tokio::net::TcpStream {
        let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let announce = format!(
            "ANNOUNCE rtsp://127.0.0.1:{port} RTSP/1.0\r\nCSeq: 1\r\n\
             Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            TEST_SDP.len(),
            TEST_SDP
        );
        let setup = format!(
            "SETUP rtsp://127.0.0.1:{port}/streamid=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n\r\n"
        );
        let record = format!("RECORD rtsp://127.0.0.1:{port} RTSP/1.0\r\nCSeq: 3\r\n\r\n");
        socket.write_all(announce.as_bytes()).await.unwrap();
        socket.write_all(setup.as_bytes()).await.unwrap();
        socket.write_all(record.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        socket
    }

    #[tokio::test]
    async fn client_reads_published_rtp_from_relay() {
        let relay = RtspRelay::bind(CancellationToken::new()).await.unwrap();
        let url = format!("rtsp://127.0.0.1:{}", relay.port());

        let mut publisher = publish_to(relay.port()).await;
        assert!(relay.wait_published(Duration::from_secs(1)).await);

        let mut client = RtspClient::connect(&url).await.unwrap();
        let sdp = client.describe_with_retry().await.unwrap();
        assert!(sdp.contains("H264"));
        assert_eq!(client.setup_all(&sdp).await.unwrap(), 1);
        client.play().await.unwrap();

        write_interleaved(
            &mut publisher,
            &InterleavedFrame {
                channel: 0,
                payload: rtp_packet_bytes(),
            },
        )
        .await
        .unwrap();
        publisher.flush().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), client.next_frame())
            .await
            .expect("no frame within timeout")
            .unwrap()
            .expect("stream ended early");
        assert_eq!(frame.channel, 0);

        let mut buf = &frame.payload[..];
        let packet = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(packet.header.ssrc, 42);
        assert_eq!(packet.payload.as_ref(), b"nal");
    }

    #[tokio::test]
    async fn describe_retry_gives_not_found_without_publisher() {
        let relay = RtspRelay::bind(CancellationToken::new()).await.unwrap();
        let url = format!("rtsp://127.0.0.1:{}", relay.port());

        let mut client = RtspClient::connect(&url).await.unwrap();
        match client.describe_with_retry().await {
            Err(RelayError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
