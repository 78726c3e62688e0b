//! Minimal RTSP 1.0 plumbing: the per-stream relay server, the consumer
//! client, and the shared wire codec.

pub mod client;
pub mod message;
pub mod relay;
