//! Media processing backend for a static photo gallery.
//!
//! Uploads land over HTTP, get classified as photo or video, and are driven
//! through ffmpeg-based pipelines: videos become multi-rendition HLS trees
//! with preview stills, photos go through a single-worker optimization queue.
//! Every job publishes an ordered progress stream consumed over SSE.

pub mod adapters;
pub mod application;
pub mod av;
pub mod config;
pub mod error;
pub mod hls;
pub mod jobs;
pub mod ports;
