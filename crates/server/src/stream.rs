use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::media::MediaPipeline;
use crate::rtsp::relay::RtspRelay;
use reel_protocol::RtspConfig;

/// How long to wait for the ffmpeg producer to ANNOUNCE on a fresh relay.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns the per-video ingest pipelines: one RTSP relay plus one looping
/// ffmpeg producer per published video.
pub struct StreamerService {
    pipeline: Arc<MediaPipeline>,
    rtsp: RtspConfig,
    root_cancel: CancellationToken,
}

/// A running ingest pipeline bound to one published track.
///
/// Dropping the handle (or calling [`shutdown`](Self::shutdown)) cancels the
/// relay, the producer process, and the consumer task together.
#[derive(Debug)]
pub struct Stream {
    pub video_name: String,
    pub rtsp_url: String,
    cancel: CancellationToken,
}

impl Stream {
    /// Child token for tasks whose lifetime is bound to this stream.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StreamerService {
    pub fn new(
        pipeline: Arc<MediaPipeline>,
        rtsp: RtspConfig,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            rtsp,
            root_cancel,
        }
    }

    /// Open a relay on a free loopback port, start the looping producer for
    /// `video_name`, and wait until the producer has announced.
    pub async fn create_stream(&self, video_name: &str) -> Result<Stream> {
        let cancel = self.root_cancel.child_token();

        let relay = RtspRelay::bind(cancel.child_token()).await?;
        let rtsp_url = format!("{}:{}", self.rtsp.address_pattern, relay.port());
        tracing::debug!(video = video_name, url = %rtsp_url, "rtsp relay ready");

        let pipeline = Arc::clone(&self.pipeline);
        let producer_cancel = cancel.child_token();
        let producer_url = rtsp_url.clone();
        let producer_video = video_name.to_string();
        tokio::spawn(async move {
            match pipeline
                .stream_to_relay(&producer_video, &producer_url, producer_cancel)
                .await
            {
                Ok(()) => tracing::info!(video = %producer_video, "rtsp producer finished"),
                Err(e) => tracing::error!(video = %producer_video, "rtsp producer failed: {e}"),
            }
        });

        if !relay.wait_published(PUBLISH_TIMEOUT).await {
            cancel.cancel();
            return Err(RelayError::Transient(format!(
                "producer for {video_name} never announced within {PUBLISH_TIMEOUT:?}"
            )));
        }

        Ok(Stream {
            video_name: video_name.to_string(),
            rtsp_url,
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use reel_protocol::FfmpegConfig;
    use uuid::Uuid;

    fn service() -> StreamerService {
        let root = std::env::temp_dir().join(format!("reel-stream-{}", Uuid::new_v4()));
        let store = Arc::new(FsBlobStore::new(root));
        let pipeline = Arc::new(MediaPipeline::new(
            store,
            FfmpegConfig::default(),
            CancellationToken::new(),
        ));
        StreamerService::new(
            pipeline,
            RtspConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn missing_video_fails_without_announce() {
        let service = service();
        // The blob does not exist, so the producer dies immediately and the
        // relay never reports a publisher.
        let err = service.create_stream("missing.mp4").await.unwrap_err();
        assert!(matches!(err, RelayError::Transient(_)));
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_children() {
        let stream = Stream {
            video_name: "clip.mp4".to_string(),
            rtsp_url: "rtsp://localhost:1".to_string(),
            cancel: CancellationToken::new(),
        };
        let child = stream.child_token();
        assert!(!child.is_cancelled());
        drop(stream);
        assert!(child.is_cancelled());
    }
}
