use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::rtsp::message::{
    InterleavedFrame, RtspMessage, RtspRequest, RtspResponse, read_message, write_interleaved,
};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, TEARDOWN";

/// A single-stream RTSP relay: one publisher, any number of readers.
///
/// One instance carries one logical stream. The relay binds an ephemeral
/// loopback port itself and reports it back, and flips a readiness signal
/// when a publisher announces, so callers never probe ports or sleep.
pub struct RtspRelay {
    port: u16,
    shared: Arc<RelayShared>,
}

struct RelayShared {
    state: Mutex<RelayState>,
    published_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    next_conn_id: AtomicU64,
}

#[derive(Default)]
struct RelayState {
    stream: Option<Arc<RelayStream>>,
    publisher: Option<PublisherHandle>,
}

struct PublisherHandle {
    conn_id: u64,
    cancel: CancellationToken,
}

/// The announced stream: its SDP plus the attached readers' outboxes.
struct RelayStream {
    sdp: String,
    readers: std::sync::Mutex<HashMap<u64, mpsc::UnboundedSender<ConnOut>>>,
}

enum ConnOut {
    Response(String),
    Frame(InterleavedFrame),
    Shutdown,
}

impl RelayStream {
    fn new(sdp: String) -> Self {
        Self {
            sdp,
            readers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn attach_reader(&self, conn_id: u64, tx: mpsc::UnboundedSender<ConnOut>) {
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn_id, tx);
    }

    fn detach_reader(&self, conn_id: u64) {
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn_id);
    }

    /// Fan one frame out to every attached reader, pruning dead ones.
    fn write_frame(&self, frame: &InterleavedFrame) {
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, tx| tx.send(ConnOut::Frame(frame.clone())).is_ok());
    }

    /// Disconnect every reader (publisher gone or preempted).
    fn close(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, tx) in readers.drain() {
            let _ = tx.send(ConnOut::Shutdown);
        }
    }
}

impl RtspRelay {
    /// Bind an ephemeral loopback port and start accepting sessions.
    pub async fn bind(cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            RelayError::ResourceExhausted(format!("no free port for rtsp relay: {e}"))
        })?;
        let port = listener.local_addr()?.port();

        let (published_tx, _) = watch::channel(false);
        let shared = Arc::new(RelayShared {
            state: Mutex::new(RelayState::default()),
            published_tx,
            cancel,
            next_conn_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        tracing::info!(port, "rtsp relay listening");

        Ok(Self { port, shared })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until a publisher has announced, up to `timeout`.
    pub async fn wait_published(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.published_tx.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<RelayShared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                tracing::debug!("rtsp relay shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("rtsp accept failed: {e}");
                        continue;
                    }
                };
                let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(conn_id, %peer_addr, "rtsp connection opened");
                tokio::spawn(handle_conn(conn_id, socket, Arc::clone(&shared)));
            }
        }
    }
}

struct Conn {
    conn_id: u64,
    shared: Arc<RelayShared>,
    cancel: CancellationToken,
    out_tx: mpsc::UnboundedSender<ConnOut>,
    /// Set once this connection SETUP a reader leg; attached on PLAY.
    reader_session: Option<String>,
    /// Stream this connection RECORDs into, cached at RECORD time.
    record_stream: Option<Arc<RelayStream>>,
}

async fn handle_conn(conn_id: u64, socket: TcpStream, shared: Arc<RelayShared>) {
    let cancel = shared.cancel.child_token();
    let (read_half, write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, out_rx, cancel.clone()));

    let mut conn = Conn {
        conn_id,
        shared: Arc::clone(&shared),
        cancel: cancel.clone(),
        out_tx,
        reader_session: None,
        record_stream: None,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = read_message(&mut reader) => match message {
                Ok(Some(RtspMessage::Request(req))) => {
                    if !conn.handle_request(req).await {
                        break;
                    }
                }
                Ok(Some(RtspMessage::Interleaved(frame))) => {
                    if let Some(stream) = &conn.record_stream {
                        stream.write_frame(&frame);
                    }
                }
                Ok(Some(RtspMessage::Response(resp))) => {
                    tracing::debug!(conn_id, status = resp.status_code, "unexpected response on server side");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(conn_id, "rtsp session error: {e}");
                    break;
                }
            }
        }
    }

    conn.cleanup().await;
    // dropping `conn` releases the last local outbox sender; the write loop
    // drains what is queued and closes the socket
    tracing::debug!(conn_id, "rtsp connection closed");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<ConnOut>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = out_rx.recv() => {
                let out = match maybe {
                    Some(out) => out,
                    None => break,
                };
                let ok = match out {
                    ConnOut::Response(text) => writer.write_all(text.as_bytes()).await.is_ok(),
                    ConnOut::Frame(frame) => write_interleaved(&mut writer, &frame).await.is_ok(),
                    ConnOut::Shutdown => break,
                };
                if !ok || writer.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

impl Conn {
    fn respond(&self, resp: RtspResponse) {
        let _ = self.out_tx.send(ConnOut::Response(resp.serialize()));
    }

    /// Dispatch one request. Returns `false` when the session should end.
    async fn handle_request(&mut self, req: RtspRequest) -> bool {
        let cseq = req.cseq().to_string();
        tracing::debug!(conn_id = self.conn_id, method = %req.method, %cseq, "rtsp request");

        match req.method.as_str() {
            "OPTIONS" => {
                self.respond(
                    RtspResponse::ok()
                        .add_header("CSeq", &cseq)
                        .add_header("Public", PUBLIC_METHODS),
                );
                true
            }
            "ANNOUNCE" => self.handle_announce(&cseq, &req).await,
            "DESCRIBE" => self.handle_describe(&cseq, &req).await,
            "SETUP" => self.handle_setup(&cseq, &req).await,
            "PLAY" => self.handle_play(&cseq).await,
            "RECORD" => self.handle_record(&cseq).await,
            "GET_PARAMETER" => {
                // keepalive
                self.respond(RtspResponse::ok().add_header("CSeq", &cseq));
                true
            }
            "TEARDOWN" => {
                self.respond(RtspResponse::ok().add_header("CSeq", &cseq));
                false
            }
            other => {
                tracing::warn!(conn_id = self.conn_id, method = other, "unsupported rtsp method");
                self.respond(RtspResponse::new(501, "Not Implemented").add_header("CSeq", &cseq));
                true
            }
        }
    }

    /// A new ANNOUNCE preempts any existing publisher: the previous stream is
    /// closed (disconnecting its readers) and its connection is cancelled.
    async fn handle_announce(&mut self, cseq: &str, req: &RtspRequest) -> bool {
        let sdp = String::from_utf8_lossy(&req.body).into_owned();
        if sdp.is_empty() {
            self.respond(RtspResponse::bad_request().add_header("CSeq", cseq));
            return true;
        }

        let mut state = self.shared.state.lock().await;
        if let Some(old_stream) = state.stream.take() {
            old_stream.close();
        }
        if let Some(old_publisher) = state.publisher.take() {
            if old_publisher.conn_id != self.conn_id {
                tracing::info!(
                    conn_id = self.conn_id,
                    preempted = old_publisher.conn_id,
                    "publisher preempted"
                );
                old_publisher.cancel.cancel();
            }
        }
        state.stream = Some(Arc::new(RelayStream::new(sdp)));
        state.publisher = Some(PublisherHandle {
            conn_id: self.conn_id,
            cancel: self.cancel.clone(),
        });
        drop(state);

        self.shared.published_tx.send_replace(true);
        self.respond(RtspResponse::ok().add_header("CSeq", cseq));
        true
    }

    async fn handle_describe(&mut self, cseq: &str, req: &RtspRequest) -> bool {
        let state = self.shared.state.lock().await;
        match &state.stream {
            Some(stream) => {
                let resp = RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Content-Type", "application/sdp")
                    .add_header("Content-Base", &req.uri)
                    .with_body(stream.sdp.clone());
                drop(state);
                self.respond(resp);
            }
            None => {
                drop(state);
                self.respond(RtspResponse::not_found().add_header("CSeq", cseq));
            }
        }
        true
    }

    async fn handle_setup(&mut self, cseq: &str, req: &RtspRequest) -> bool {
        let has_stream = self.shared.state.lock().await.stream.is_some();
        if !has_stream {
            self.respond(RtspResponse::not_found().add_header("CSeq", cseq));
            return true;
        }

        let Some(transport) = req.header("Transport") else {
            self.respond(RtspResponse::bad_request().add_header("CSeq", cseq));
            return true;
        };

        // Only interleaved TCP is carried; UDP offers get 461 so ffmpeg
        // retries over TCP.
        if !transport.contains("interleaved") {
            self.respond(
                RtspResponse::unsupported_transport()
                    .add_header("CSeq", cseq)
                    .add_header("Unsupported", "RTP/AVP (UDP); use interleaved TCP"),
            );
            return true;
        }

        let session = self
            .reader_session
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let is_record = transport.contains("mode=record");
        if !is_record {
            self.reader_session = Some(session.clone());
        }

        self.respond(
            RtspResponse::ok()
                .add_header("CSeq", cseq)
                .add_header("Transport", transport)
                .add_header("Session", &session),
        );
        true
    }

    /// PLAY attaches the reader to the stream; frames start flowing with the
    /// next packet the publisher records.
    async fn handle_play(&mut self, cseq: &str) -> bool {
        let Some(session) = self.reader_session.clone() else {
            self.respond(RtspResponse::new(454, "Session Not Found").add_header("CSeq", cseq));
            return true;
        };

        let state = self.shared.state.lock().await;
        match &state.stream {
            Some(stream) => {
                stream.attach_reader(self.conn_id, self.out_tx.clone());
                drop(state);
                self.respond(
                    RtspResponse::ok()
                        .add_header("CSeq", cseq)
                        .add_header("Session", &session)
                        .add_header("Range", "npt=0.000-"),
                );
            }
            None => {
                drop(state);
                self.respond(RtspResponse::not_found().add_header("CSeq", cseq));
            }
        }
        true
    }

    /// RECORD arms the fan-out: every interleaved frame this connection sends
    /// from now on is routed to all attached readers.
    async fn handle_record(&mut self, cseq: &str) -> bool {
        let state = self.shared.state.lock().await;
        let is_publisher = state
            .publisher
            .as_ref()
            .is_some_and(|p| p.conn_id == self.conn_id);
        if !is_publisher {
            drop(state);
            self.respond(
                RtspResponse::new(455, "Method Not Valid in This State").add_header("CSeq", cseq),
            );
            return true;
        }

        self.record_stream = state.stream.clone();
        drop(state);
        self.respond(RtspResponse::ok().add_header("CSeq", cseq));
        true
    }

    /// Runs when the connection ends for any reason. A departing publisher
    /// takes the stream down with it; a departing reader just detaches.
    async fn cleanup(&mut self) {
        let mut state = self.shared.state.lock().await;
        let was_publisher = state
            .publisher
            .as_ref()
            .is_some_and(|p| p.conn_id == self.conn_id);

        if was_publisher {
            state.publisher = None;
            if let Some(stream) = state.stream.take() {
                stream.close();
            }
            drop(state);
            self.shared.published_tx.send_replace(false);
            tracing::info!(conn_id = self.conn_id, "publisher disconnected, stream closed");
        } else if let Some(stream) = &state.stream {
            stream.detach_reader(self.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::BufReader;
    use tokio::net::tcp::OwnedReadHalf;

    const TEST_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Test\r\n\
                            m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:streamid=0\r\n";

    struct TestConn {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        cseq: u32,
    }

    impl TestConn {
        async fn connect(port: u16) -> Self {
            let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (read_half, write_half) = socket.into_split();
            Self {
                reader: BufReader::new(read_half),
                writer: write_half,
                cseq: 0,
            }
        }

        async fn request(&mut self, method: &str, headers: &[(&str, &str)], body: &str) -> RtspResponse {
            self.cseq += 1;
            let mut req = RtspRequest {
                method: method.to_string(),
                uri: "rtsp://127.0.0.1/stream".to_string(),
                version: "RTSP/1.0".to_string(),
                headers: vec![("CSeq".to_string(), self.cseq.to_string())],
                body: body.as_bytes().to_vec(),
            };
            for (name, value) in headers {
                req.headers.push((name.to_string(), value.to_string()));
            }
            self.writer
                .write_all(req.serialize().as_bytes())
                .await
                .unwrap();

            match read_message(&mut self.reader).await.unwrap() {
                Some(RtspMessage::Response(resp)) => resp,
                other => panic!("expected response, got {other:?}"),
            }
        }

        async fn next_frame(&mut self) -> Option<InterleavedFrame> {
            match read_message(&mut self.reader).await.ok()? {
                Some(RtspMessage::Interleaved(frame)) => Some(frame),
                _ => None,
            }
        }
    }

    async fn relay() -> RtspRelay {
        RtspRelay::bind(CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn describe_without_publisher_is_404() {
        let relay = relay().await;
        let mut conn = TestConn::connect(relay.port()).await;
        let resp = conn.request("DESCRIBE", &[], "").await;
        assert_eq!(resp.status_code, 404);
    }

    #[tokio::test]
    async fn options_lists_methods() {
        let relay = relay().await;
        let mut conn = TestConn::connect(relay.port()).await;
        let resp = conn.request("OPTIONS", &[], "").await;
        assert_eq!(resp.status_code, 200);
        assert!(resp.header("Public").unwrap().contains("ANNOUNCE"));
    }

    #[tokio::test]
    async fn announce_publishes_and_describe_returns_sdp() {
        let relay = relay().await;

        let mut publisher = TestConn::connect(relay.port()).await;
        let resp = publisher.request("ANNOUNCE", &[], TEST_SDP).await;
        assert_eq!(resp.status_code, 200);

        assert!(relay.wait_published(Duration::from_secs(1)).await);

        let mut viewer = TestConn::connect(relay.port()).await;
        let resp = viewer.request("DESCRIBE", &[], "").await;
        assert_eq!(resp.status_code, 200);
        assert!(resp.body.unwrap().contains("H264/90000"));
    }

    #[tokio::test]
    async fn rtp_flows_from_publisher_to_reader() {
        let relay = relay().await;

        let mut publisher = TestConn::connect(relay.port()).await;
        assert_eq!(publisher.request("ANNOUNCE", &[], TEST_SDP).await.status_code, 200);
        let resp = publisher
            .request(
                "SETUP",
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")],
                "",
            )
            .await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(publisher.request("RECORD", &[], "").await.status_code, 200);

        let mut reader = TestConn::connect(relay.port()).await;
        assert_eq!(reader.request("DESCRIBE", &[], "").await.status_code, 200);
        let resp = reader
            .request(
                "SETUP",
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
                "",
            )
            .await;
        assert_eq!(resp.status_code, 200);
        assert!(resp.header("Session").is_some());
        assert_eq!(reader.request("PLAY", &[], "").await.status_code, 200);

        let payload = Bytes::from_static(&[0x80, 0x60, 0x12, 0x34]);
        write_interleaved(
            &mut publisher.writer,
            &InterleavedFrame {
                channel: 0,
                payload: payload.clone(),
            },
        )
        .await
        .unwrap();
        publisher.writer.flush().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), reader.next_frame())
            .await
            .expect("no frame within timeout")
            .expect("reader disconnected");
        assert_eq!(frame.channel, 0);
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn second_announce_preempts_first_publisher() {
        let relay = relay().await;

        let mut first = TestConn::connect(relay.port()).await;
        assert_eq!(first.request("ANNOUNCE", &[], TEST_SDP).await.status_code, 200);

        let mut second = TestConn::connect(relay.port()).await;
        assert_eq!(second.request("ANNOUNCE", &[], TEST_SDP).await.status_code, 200);

        // The preempted publisher's connection is closed by the relay.
        let eof = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match read_message(&mut first.reader).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "preempted publisher was not disconnected");

        // The new publisher still owns the stream.
        let mut viewer = TestConn::connect(relay.port()).await;
        assert_eq!(viewer.request("DESCRIBE", &[], "").await.status_code, 200);
    }

    #[tokio::test]
    async fn udp_transport_is_rejected() {
        let relay = relay().await;
        let mut publisher = TestConn::connect(relay.port()).await;
        assert_eq!(publisher.request("ANNOUNCE", &[], TEST_SDP).await.status_code, 200);
        let resp = publisher
            .request(
                "SETUP",
                &[("Transport", "RTP/AVP;unicast;client_port=5000-5001;mode=record")],
                "",
            )
            .await;
        assert_eq!(resp.status_code, 461);
    }

    #[tokio::test]
    async fn cancellation_closes_sessions() {
        let cancel = CancellationToken::new();
        let relay = RtspRelay::bind(cancel.clone()).await.unwrap();

        let mut conn = TestConn::connect(relay.port()).await;
        assert_eq!(conn.request("OPTIONS", &[], "").await.status_code, 200);

        cancel.cancel();

        let eof = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match read_message(&mut conn.reader).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "session survived relay cancellation");
    }
}
