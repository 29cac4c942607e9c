// src/layout.rs
//
// Camera layout calibration: projects per-camera frame indices onto the
// shared timeline and answers whether two tracklets are temporally
// compatible at all. The actual offset/scale values come from config.

use crate::track::Tracklet;
use crate::types::CameraConfig;

#[derive(Debug, Clone)]
pub struct CameraLayout {
    frame_rate: Vec<f64>,
    time_scale: Vec<f64>,
    time_offset: Vec<f64>,
    max_gap_secs: f64,
}

impl CameraLayout {
    /// `source_rates` carries the frame rate each video source reported,
    /// used for cameras that do not pin one in config.
    pub fn new(cameras: &[CameraConfig], source_rates: &[f64], max_gap_secs: f64) -> Self {
        let frame_rate = cameras
            .iter()
            .enumerate()
            .map(|(i, c)| {
                c.frame_rate
                    .or_else(|| source_rates.get(i).copied())
                    .filter(|r| *r > 0.0)
                    .unwrap_or(30.0)
            })
            .collect();
        Self {
            frame_rate,
            time_scale: cameras.iter().map(|c| c.time_scale).collect(),
            time_offset: cameras.iter().map(|c| c.time_offset).collect(),
            max_gap_secs,
        }
    }

    /// Shared-timeline timestamp of a local frame index on one camera.
    pub fn project(&self, camera: usize, frame_index: u64) -> f64 {
        let fps = self.frame_rate.get(camera).copied().unwrap_or(30.0);
        let scale = self.time_scale.get(camera).copied().unwrap_or(1.0);
        let offset = self.time_offset.get(camera).copied().unwrap_or(0.0);
        frame_index as f64 / fps / scale + offset
    }

    /// Fill a tracklet's global interval from its first/last tick.
    pub fn project_tracklet(&self, tracklet: &mut Tracklet) {
        if let (Some(first), Some(last)) = (tracklet.first_tick(), tracklet.last_tick()) {
            tracklet.global_start = self.project(tracklet.camera, first);
            tracklet.global_end = self.project(tracklet.camera, last);
        }
    }

    /// Temporal compatibility of two tracklets from different cameras:
    /// their global intervals overlap or lie within `max_gap_secs` of each
    /// other. Same-camera pairs are handled by the clustering constraints,
    /// not here.
    pub fn compatible(&self, a: &Tracklet, b: &Tracklet) -> bool {
        let gap = if a.global_end < b.global_start {
            b.global_start - a.global_end
        } else if b.global_end < a.global_start {
            a.global_start - b.global_end
        } else {
            0.0
        };
        gap <= self.max_gap_secs
    }
}
