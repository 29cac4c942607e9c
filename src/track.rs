// src/track.rs
//
// Per-camera tracklets and their cross-camera aggregation types. The
// tracker owns the live Tracklets; the aggregator only ever sees frozen
// snapshots of them.

use std::collections::HashMap;

/// (camera index, local track id) — unique across the whole deployment.
pub type TrackKey = (usize, u64);

/// Per-camera mapping from local track id to global id, rebuilt on every
/// clustering pass. Global ids are only meaningful within one snapshot.
pub type IdentityMap = HashMap<u64, u64>;

/// One tracked object's trajectory within a single camera.
#[derive(Debug, Clone)]
pub struct Tracklet {
    pub local_id: u64,
    pub camera: usize,
    /// Ticks at which the object was observed, strictly increasing.
    pub ticks: Vec<u64>,
    /// Bounding boxes (TLWH, source image coordinates), parallel to `ticks`.
    pub boxes: Vec<[f32; 4]>,
    /// Interval on the shared timeline, filled in via `CameraLayout`.
    pub global_start: f64,
    pub global_end: f64,
    embedding_sum: Vec<f32>,
    embedding_count: usize,
}

impl Tracklet {
    pub fn new(camera: usize, local_id: u64) -> Self {
        Self {
            local_id,
            camera,
            ticks: Vec::new(),
            boxes: Vec::new(),
            global_start: 0.0,
            global_end: 0.0,
            embedding_sum: Vec::new(),
            embedding_count: 0,
        }
    }

    pub fn key(&self) -> TrackKey {
        (self.camera, self.local_id)
    }

    pub fn push(&mut self, tick: u64, bbox: [f32; 4]) {
        self.ticks.push(tick);
        self.boxes.push(bbox);
    }

    pub fn add_embedding(&mut self, embedding: &[f32]) {
        if self.embedding_sum.is_empty() {
            self.embedding_sum = vec![0.0; embedding.len()];
        }
        if self.embedding_sum.len() != embedding.len() {
            return;
        }
        for (acc, v) in self.embedding_sum.iter_mut().zip(embedding) {
            *acc += v;
        }
        self.embedding_count += 1;
    }

    /// Running mean of all embeddings seen so far, L2-normalised.
    pub fn mean_embedding(&self) -> Option<Vec<f32>> {
        if self.embedding_count == 0 {
            return None;
        }
        let n = self.embedding_count as f32;
        let mut mean: Vec<f32> = self.embedding_sum.iter().map(|v| v / n).collect();
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            for v in &mut mean {
                *v /= norm;
            }
        }
        Some(mean)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn first_tick(&self) -> Option<u64> {
        self.ticks.first().copied()
    }

    pub fn last_tick(&self) -> Option<u64> {
        self.ticks.last().copied()
    }

    pub fn last_box(&self) -> Option<[f32; 4]> {
        self.boxes.last().copied()
    }

    /// Whether two tracklets were observed at overlapping ticks. Only
    /// meaningful for tracklets on the same camera.
    pub fn ticks_overlap(&self, other: &Tracklet) -> bool {
        match (
            self.first_tick(),
            self.last_tick(),
            other.first_tick(),
            other.last_tick(),
        ) {
            (Some(a0), Some(a1), Some(b0), Some(b1)) => a0 <= b1 && b0 <= a1,
            _ => false,
        }
    }
}

/// A cluster of tracklets believed to be one physical object.
#[derive(Debug, Clone)]
pub struct GlobalTrack {
    pub global_id: u64,
    pub members: Vec<TrackKey>,
}

/// Intersection-over-union of two TLWH boxes.
pub(crate) fn iou_tlwh(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ax1 = a[0];
    let ay1 = a[1];
    let ax2 = a[0] + a[2];
    let ay2 = a[1] + a[3];
    let bx1 = b[0];
    let by1 = b[1];
    let bx2 = b[0] + b[2];
    let by2 = b[1] + b[3];

    let ix = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let iy = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let intersection = ix * iy;
    let union = a[2] * a[3] + b[2] * b[3] - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
