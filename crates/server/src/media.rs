use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::runner::Runner;
use crate::storage::{BlobReader, BlobStore, DEFAULT_CONTENT_TYPE};
use reel_protocol::FfmpegConfig;

/// Codecs that can be served without normalization: H.264 for the WebRTC
/// fan-out plus the codecs the RTSP leg can carry as-is.
pub const SUPPORTED_CODECS: &[&str] = &["h264", "h265", "vp8", "vp9"];

/// Probes uploads, normalizes them in the background when needed, and drives
/// the looping RTSP producer for published videos.
pub struct MediaPipeline {
    store: Arc<dyn BlobStore>,
    runner: Runner,
    ffmpeg: FfmpegConfig,
    cancel: CancellationToken,
}

impl MediaPipeline {
    pub fn new(store: Arc<dyn BlobStore>, ffmpeg: FfmpegConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            runner: Runner,
            ffmpeg,
            cancel,
        }
    }

    /// Name of the first video stream's codec, trimmed. Empty output means
    /// ffprobe found no video stream.
    pub async fn probe_codec(&self, data: Bytes) -> Result<String> {
        let stdout = self
            .runner
            .run_collected(
                "ffprobe",
                &[
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=codec_name",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    "pipe:0",
                ],
                Some(Box::new(std::io::Cursor::new(data))),
            )
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Decide whether an upload needs normalization and, if so, start the
    /// background transcode-and-store task. Returns `true` when a conversion
    /// is in progress (the caller should report `isConverting`).
    ///
    /// A failed probe counts as an unknown codec and triggers conversion
    /// rather than failing the upload.
    pub async fn process_upload(&self, data: Bytes, filename: &str) -> bool {
        let codec = match self.probe_codec(data.clone()).await {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!(video = filename, "codec probe failed, converting: {e}");
                String::new()
            }
        };

        if !codec.is_empty() && codec_supported(&codec) {
            tracing::info!(video = filename, codec, "upload stored without conversion");
            return false;
        }

        tracing::info!(video = filename, codec, "unsupported codec, converting");
        let store = Arc::clone(&self.store);
        let runner = self.runner;
        let ffmpeg = self.ffmpeg.clone();
        let cancel = self.cancel.child_token();
        let filename = filename.to_string();
        tokio::spawn(async move {
            if let Err(e) = transcode_and_store(runner, store, &ffmpeg, data, &filename, cancel).await
            {
                tracing::error!(video = %filename, "background conversion failed: {e}");
            }
        });
        true
    }

    /// Feed a stored video into the relay at `rtsp_url`, looping the input
    /// until the token fires. Blocks for the lifetime of the producer.
    pub async fn stream_to_relay(
        &self,
        blob_name: &str,
        rtsp_url: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let blob = self.store.get(blob_name).await?;
        self.runner
            .run_to_completion(
                "ffmpeg",
                &[
                    "-re",
                    "-stream_loop",
                    "-1",
                    "-i",
                    "pipe:0",
                    "-c",
                    "copy",
                    "-bsf:v",
                    "h264_mp4toannexb",
                    "-f",
                    &self.ffmpeg.protocol,
                    rtsp_url,
                ],
                Some(blob),
                cancel,
            )
            .await
    }
}

fn codec_supported(codec: &str) -> bool {
    let codec = codec.to_ascii_lowercase();
    SUPPORTED_CODECS.contains(&codec.as_str())
}

async fn transcode_and_store(
    runner: Runner,
    store: Arc<dyn BlobStore>,
    ffmpeg: &FfmpegConfig,
    data: Bytes,
    filename: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let input: BlobReader = Box::new(std::io::Cursor::new(data));
    let mut child = runner.run_streaming(
        "ffmpeg",
        &[
            "-i",
            "pipe:0",
            "-c:v",
            &ffmpeg.conversion_codec,
            "-crf",
            &ffmpeg.conversion_crf,
            "-f",
            "mpegts",
            "pipe:1",
        ],
        Some(input),
        cancel,
    )?;

    let Some(stdout) = child.take_stdout() else {
        return Err(crate::error::RelayError::InvalidState(
            "streaming child already drained".to_string(),
        ));
    };
    let written = store
        .put(filename, Box::new(stdout), DEFAULT_CONTENT_TYPE)
        .await?;
    child.wait().await?;

    tracing::info!(video = filename, written, "converted video stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_codecs_case_insensitive() {
        assert!(codec_supported("h264"));
        assert!(codec_supported("H264"));
        assert!(codec_supported("H265"));
        assert!(codec_supported("vp8"));
        assert!(codec_supported("VP9"));
        assert!(!codec_supported("mpeg4"));
        assert!(!codec_supported("av1"));
        assert!(!codec_supported(""));
    }
}
