// src/types.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub detection: DetectionConfig,
    pub reid: ReidConfig,
    pub clock: ClockConfig,
    pub clustering: ClusteringConfig,
    pub live: LiveConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub video: String,
    /// Frame rate used to project local frame indices onto the shared
    /// timeline. Falls back to the rate reported by the video source.
    #[serde(default)]
    pub frame_rate: Option<f64>,
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    #[serde(default)]
    pub time_offset: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    pub tracked_classes: Vec<usize>,
    #[serde(default = "default_iou_threshold")]
    pub tracker_iou_threshold: f32,
    #[serde(default = "default_min_hits")]
    pub tracker_min_hits: usize,
    #[serde(default = "default_max_misses")]
    pub tracker_max_misses: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReidConfig {
    pub model_path: String,
    #[serde(default = "default_reid_width")]
    pub input_width: usize,
    #[serde(default = "default_reid_height")]
    pub input_height: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub tick_interval_secs: f64,
    pub max_skew_ticks: u64,
    pub stall_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub min_similarity: f32,
    pub linkage: String,
    pub min_track_frames: usize,
    pub recluster_interval_secs: f64,
    /// Maximum time gap between tracklet intervals on different cameras for
    /// a merge to be considered. Same-camera overlaps are always forbidden.
    #[serde(default = "default_max_gap")]
    pub max_gap_secs: f64,
    /// Upper bound on the combined tracklet set per clustering pass; the
    /// oldest tracklets are dropped first. 0 disables the cap.
    #[serde(default)]
    pub max_tracklets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub target_fps: f64,
    pub loop_video: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_iou_threshold() -> f32 {
    0.3
}

fn default_min_hits() -> usize {
    3
}

fn default_max_misses() -> usize {
    10
}

fn default_reid_width() -> usize {
    128
}

fn default_reid_height() -> usize {
    256
}

fn default_max_gap() -> f64 {
    15.0
}

/// One decoded video frame as packed RGB bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}
