use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::Result;
use crate::rtsp::client;
use crate::stream::{Stream, StreamerService};
use reel_protocol::SignalFrame;

/// Bounded retry for the renegotiation walk; on exhaustion the lock is
/// released and another pass is scheduled shortly after.
const MAX_SYNC_ATTEMPTS: u32 = 25;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Late joiners need an intra-coded frame promptly; a PLI goes out to every
/// receiver on this interval regardless of sync activity.
const KEY_FRAME_INTERVAL: Duration = Duration::from_secs(3);

/// WebRTC signaling and media fan-out hub.
///
/// Owns the connected peers, the published tracks, and the renegotiation
/// loop that keeps every peer subscribed to every track. Socket handlers
/// never hold peer references across the room: all mutation goes through
/// the room under one lock.
pub struct PeerRoom {
    /// Guards `peers` and `tracks` together; the renegotiation protocol
    /// requires serialized signaling per peer.
    state: Mutex<RoomState>,
    /// Ingest pipeline per published track id. A removed entry cancels its
    /// relay, producer, and consumer on drop.
    streams: Mutex<HashMap<String, Stream>>,
    streamer: StreamerService,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RoomState {
    peers: Vec<Peer>,
    tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
}

struct Peer {
    id: Uuid,
    conn: Arc<RTCPeerConnection>,
    /// Serialized writer: frames are drained by the single socket-owning
    /// task, so there is never more than one write in flight.
    outbox: mpsc::UnboundedSender<SignalFrame>,
}

impl PeerRoom {
    pub fn new(streamer: StreamerService, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RoomState::default()),
            streams: Mutex::new(HashMap::new()),
            streamer,
            cancel,
        })
    }

    /// Periodic PLI dispatch; runs until the root token fires.
    pub async fn run_key_frame_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEY_FRAME_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.dispatch_key_frame().await,
            }
        }
    }

    /// Handle one browser's signaling socket for its whole lifetime.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket) {
        let peer_id = Uuid::new_v4();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SignalFrame>();

        let pc = match new_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                tracing::error!(%peer_id, "failed to create peer connection: {e}");
                return;
            }
        };

        if let Err(e) = self.wire_peer(peer_id, &pc, &outbox_tx).await {
            tracing::error!(%peer_id, "failed to wire peer: {e}");
            let _ = pc.close().await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.peers.push(Peer {
                id: peer_id,
                conn: Arc::clone(&pc),
                outbox: outbox_tx.clone(),
            });
        }
        tracing::info!(%peer_id, "peer connected");

        // Initial pass sends the first offer even when no tracks exist yet.
        self.sync().await;

        loop {
            tokio::select! {
                maybe_frame = outbox_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(%peer_id, "failed to serialize {} frame: {e}", frame.event());
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                maybe_msg = socket.recv() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match serde_json::from_str::<SignalFrame>(&text) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    tracing::warn!(%peer_id, "invalid signaling frame: {e}");
                                    break;
                                }
                            };
                            if self.dispatch(peer_id, &pc, &outbox_tx, frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // ping/pong handled by axum, binary ignored
                        Some(Err(e)) => {
                            tracing::debug!(%peer_id, "socket error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = pc.close().await {
            tracing::debug!(%peer_id, "peer close failed: {e}");
        }
        // The next pass reaps the closed connection from the peer set.
        self.sync().await;
        tracing::info!(%peer_id, "peer disconnected");
    }

    /// Install connection callbacks and the legacy receive-only video
    /// transceiver the browser client expects.
    async fn wire_peer(
        self: &Arc<Self>,
        peer_id: Uuid,
        pc: &Arc<RTCPeerConnection>,
        outbox: &mpsc::UnboundedSender<SignalFrame>,
    ) -> anyhow::Result<()> {
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        // Trickle ICE: forward server candidates to the browser.
        let ice_outbox = outbox.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let ice_outbox = ice_outbox.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        if let Ok(json) = serde_json::to_string(&init) {
                            let _ = ice_outbox.send(SignalFrame::Candidate(json));
                        }
                    }
                    Err(e) => tracing::warn!(%peer_id, "failed to serialize ICE candidate: {e}"),
                }
            })
        }));

        // Failed connections are closed; Closed connections are reaped by the
        // next sync pass.
        let room = Arc::clone(self);
        let state_pc = Arc::downgrade(pc);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let room = Arc::clone(&room);
            let state_pc = state_pc.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        if let Some(pc) = state_pc.upgrade() {
                            if let Err(e) = pc.close().await {
                                tracing::warn!(%peer_id, "close after failure: {e}");
                            }
                        }
                    }
                    RTCPeerConnectionState::Closed => room.sync().await,
                    other => tracing::debug!(%peer_id, state = %other, "connection state changed"),
                }
            })
        }));

        for sender in pc.get_senders().await {
            spawn_rtcp_drain(sender);
        }

        Ok(())
    }

    /// Route one parsed frame from the socket. An `Err` closes the peer.
    async fn dispatch(
        self: &Arc<Self>,
        peer_id: Uuid,
        pc: &Arc<RTCPeerConnection>,
        outbox: &mpsc::UnboundedSender<SignalFrame>,
        frame: SignalFrame,
    ) -> anyhow::Result<()> {
        match frame {
            SignalFrame::Candidate(data) => {
                let init: RTCIceCandidateInit = serde_json::from_str(&data)?;
                pc.add_ice_candidate(init).await?;
                Ok(())
            }
            SignalFrame::Answer(data) => {
                let answer: RTCSessionDescription = serde_json::from_str(&data)?;
                pc.set_remote_description(answer).await?;
                Ok(())
            }
            SignalFrame::Publish(data) => {
                // the name arrives JSON.stringify'd, so strip the quoting
                let video_name = data.replace('"', "");
                tracing::debug!(%peer_id, video = %video_name, "publish requested");
                match self.publish(&video_name).await {
                    Ok(track_id) => {
                        tracing::info!(%peer_id, video = %video_name, track_id, "published");
                    }
                    Err(e) => {
                        tracing::error!(%peer_id, video = %video_name, "publish failed: {e}");
                        let _ = outbox.send(SignalFrame::Error(format!(
                            "failed to publish {video_name}: {e}"
                        )));
                    }
                }
                Ok(())
            }
            SignalFrame::Remove(track_id) => {
                self.remove_track(&track_id).await;
                Ok(())
            }
            other => {
                tracing::warn!(%peer_id, event = other.event(), "unexpected client frame");
                Ok(())
            }
        }
    }

    /// Start the ingest pipeline for a stored video and expose it as a new
    /// local track. Returns the minted track id.
    pub async fn publish(self: &Arc<Self>, video_name: &str) -> Result<String> {
        let stream = self.streamer.create_stream(video_name).await?;

        let track_id = Uuid::new_v4().to_string();
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            track_id.clone(),
            track_id.clone(),
        ));

        let consumer_url = stream.rtsp_url.clone();
        let consumer_cancel = stream.child_token();
        let consumer_track = Arc::clone(&track);
        self.streams.lock().await.insert(track_id.clone(), stream);

        tokio::spawn(async move {
            if let Err(e) = client::consume(&consumer_url, consumer_track, consumer_cancel).await {
                tracing::warn!(url = %consumer_url, "rtsp consumer failed: {e}");
            }
        });

        self.add_track(track).await;
        Ok(track_id)
    }

    /// Insert into the publication set and fire renegotiation.
    pub async fn add_track(self: &Arc<Self>, track: Arc<TrackLocalStaticRTP>) {
        {
            let mut state = self.state.lock().await;
            state.tracks.insert(track.id().to_string(), track);
        }
        self.sync().await;
    }

    /// Remove from the publication set, tear down the owning ingest
    /// pipeline, and fire renegotiation.
    pub async fn remove_track(self: &Arc<Self>, track_id: &str) {
        {
            let mut state = self.state.lock().await;
            if state.tracks.remove(track_id).is_none() {
                tracing::warn!(track_id, "remove for unknown track");
            }
        }
        if let Some(stream) = self.streams.lock().await.remove(track_id) {
            tracing::info!(track_id, video = %stream.video_name, "stream shut down");
            stream.shutdown();
        }
        self.sync().await;
    }

    /// The central renegotiation routine: reconcile every peer's senders with
    /// the publication set, restarting the walk whenever it mutates shared
    /// state, bounded at [`MAX_SYNC_ATTEMPTS`] with a deferred retry.
    pub async fn sync(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            let mut converged = false;
            for _ in 0..MAX_SYNC_ATTEMPTS {
                if !self.attempt_sync(&mut state).await {
                    converged = true;
                    break;
                }
            }
            if !converged {
                // We may be starving a concurrent add/remove; back off with
                // the lock released and try again shortly.
                schedule_sync_retry(Arc::clone(self));
            }
        }
        self.dispatch_key_frame().await;
    }

    /// One walk over all peers. Returns `true` when shared state was mutated
    /// or a peer operation failed, meaning the walk must restart.
    async fn attempt_sync(&self, state: &mut RoomState) -> bool {
        for index in 0..state.peers.len() {
            if state.peers[index].conn.connection_state() == RTCPeerConnectionState::Closed {
                let gone = state.peers.remove(index);
                tracing::debug!(peer_id = %gone.id, "reaped closed peer");
                return true;
            }
            let peer = &state.peers[index];

            // Track ids this peer already handles, so nothing is double-sent.
            let mut existing = HashSet::new();

            for sender in peer.conn.get_senders().await {
                let Some(track) = sender.track().await else {
                    continue;
                };
                let track_id = track.id().to_string();
                let stale = !state.tracks.contains_key(&track_id);
                existing.insert(track_id);
                if stale && peer.conn.remove_track(&sender).await.is_err() {
                    return true;
                }
            }

            // Receivers count too: never loop a peer's own media back at it.
            for receiver in peer.conn.get_receivers().await {
                if let Some(track) = receiver.tracks().await.into_iter().next() {
                    existing.insert(track.id().to_string());
                }
            }

            for (track_id, track) in &state.tracks {
                if existing.contains(track_id) {
                    continue;
                }
                let transceiver = peer
                    .conn
                    .add_transceiver_from_track(
                        Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await;
                match transceiver {
                    // interceptors only run if someone reads sender RTCP
                    Ok(transceiver) => spawn_rtcp_drain(transceiver.sender().await),
                    Err(_) => return true,
                }
            }

            let offer = match peer.conn.create_offer(None).await {
                Ok(offer) => offer,
                Err(_) => return true,
            };
            if peer.conn.set_local_description(offer.clone()).await.is_err() {
                return true;
            }
            let offer_json = match serde_json::to_string(&offer) {
                Ok(json) => json,
                Err(_) => return true,
            };
            if peer.outbox.send(SignalFrame::Offer(offer_json)).is_err() {
                return true;
            }
        }
        false
    }

    /// Ask every connected browser for a fresh intra-coded frame.
    ///
    /// Targets are snapshotted under the lock; the RTCP writes happen
    /// outside it to keep the critical section small.
    pub async fn dispatch_key_frame(&self) {
        let targets: Vec<(Arc<RTCPeerConnection>, u32)> = {
            let state = self.state.lock().await;
            let mut targets = Vec::new();
            for peer in &state.peers {
                for receiver in peer.conn.get_receivers().await {
                    if let Some(track) = receiver.tracks().await.into_iter().next() {
                        targets.push((Arc::clone(&peer.conn), track.ssrc()));
                    }
                }
            }
            targets
        };

        for (conn, media_ssrc) in targets {
            let pli: Box<dyn webrtc::rtcp::packet::Packet + Send + Sync> =
                Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                });
            if let Err(e) = conn.write_rtcp(&[pli]).await {
                tracing::debug!("PLI write failed: {e}");
            }
        }
    }
}

fn schedule_sync_retry(room: Arc<PeerRoom>) {
    tokio::spawn(async move {
        tokio::time::sleep(SYNC_RETRY_DELAY).await;
        room.sync().await;
    });
}

/// Drain RTCP from a sender so its interceptors (NACK, PLI bookkeeping)
/// keep running; the reports themselves are not used.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        while sender.read_rtcp().await.is_ok() {}
    });
}

/// Peer connection with the default codec and interceptor set.
async fn new_peer_connection() -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    Ok(Arc::new(
        api.new_peer_connection(RTCConfiguration::default()).await?,
    ))
}
