use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rtsp: RtspConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to static client files served under /static
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory video blobs are stored in (created on startup)
    #[serde(default = "default_storage_root")]
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtspConfig {
    /// Prefix used to build per-stream RTSP URLs; the relay's ephemeral
    /// port is appended (e.g. `rtsp://localhost` → `rtsp://localhost:37201`).
    #[serde(default = "default_address_pattern")]
    pub address_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// Output muxer handed to the looping producer (`-f <protocol>`)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Target codec for upload normalization (`-c:v <codec>`)
    #[serde(default = "default_conversion_codec")]
    pub conversion_codec: String,
    /// Constant rate factor for normalization (`-crf <value>`)
    #[serde(default = "default_conversion_crf")]
    pub conversion_crf: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            address_pattern: default_address_pattern(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            conversion_codec: default_conversion_codec(),
            conversion_crf: default_conversion_crf(),
        }
    }
}

impl ReelConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if !self.rtsp.address_pattern.starts_with("rtsp://") {
            issues.push(format!(
                "ERROR: rtsp.address_pattern must start with rtsp://, got '{}'.",
                self.rtsp.address_pattern
            ));
        }
        if self.rtsp.address_pattern.trim_end_matches('/').contains(':')
            && self.rtsp.address_pattern.rfind(':') != self.rtsp.address_pattern.find(':')
        {
            issues.push(format!(
                "WARNING: rtsp.address_pattern '{}' already carries a port; \
                 the relay appends its own ephemeral port.",
                self.rtsp.address_pattern
            ));
        }

        if self.ffmpeg.protocol.is_empty() {
            issues.push("ERROR: ffmpeg.protocol must not be empty (typically 'rtsp').".to_string());
        }
        if self.ffmpeg.conversion_codec.is_empty() {
            issues.push("ERROR: ffmpeg.conversion_codec must not be empty.".to_string());
        }
        if self.ffmpeg.conversion_crf.parse::<u8>().is_err() {
            issues.push(format!(
                "ERROR: ffmpeg.conversion_crf must be a small integer, got '{}'.",
                self.ffmpeg.conversion_crf
            ));
        }

        if self.storage.root.is_empty() {
            issues.push("ERROR: storage.root must not be empty.".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_web_root() -> String {
    "./static".to_string()
}

fn default_storage_root() -> String {
    "./data/videos".to_string()
}

fn default_address_pattern() -> String {
    "rtsp://localhost".to_string()
}

fn default_protocol() -> String {
    "rtsp".to_string()
}

fn default_conversion_codec() -> String {
    "libx264".to_string()
}

fn default_conversion_crf() -> String {
    "23".to_string()
}
