// src/tracker.rs
//
// Per-camera short-term tracker: greedy IOU association of detections to
// live tracks. Tracks are confirmed after `min_hits` consecutive matches
// and dropped after `max_misses` consecutive misses. Local ids are
// allocated monotonically and never reused within one camera.

use crate::detector::Detection;
use crate::track::{iou_tlwh, Tracklet};

struct TrackEntry {
    tracklet: Tracklet,
    hits: usize,
    misses: usize,
    confirmed: bool,
}

pub struct IouTracker {
    camera: usize,
    iou_threshold: f32,
    min_hits: usize,
    max_misses: usize,
    next_id: u64,
    tracks: Vec<TrackEntry>,
}

impl IouTracker {
    pub fn new(camera: usize, iou_threshold: f32, min_hits: usize, max_misses: usize) -> Self {
        Self {
            camera,
            iou_threshold,
            min_hits: min_hits.max(1),
            max_misses,
            next_id: 1,
            tracks: Vec::new(),
        }
    }

    /// Associate this tick's detections with live tracks and return
    /// snapshots of the confirmed tracks matched on this tick.
    pub fn update(&mut self, tick: u64, detections: &[Detection]) -> Vec<Tracklet> {
        let mut det_used = vec![false; detections.len()];
        let mut trk_used = vec![false; self.tracks.len()];

        // Greedy matching: best IOU pair first.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, entry) in self.tracks.iter().enumerate() {
            let Some(last) = entry.tracklet.last_box() else {
                continue;
            };
            for (di, det) in detections.iter().enumerate() {
                let iou = iou_tlwh(&last, &det.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _) in pairs {
            if trk_used[ti] || det_used[di] {
                continue;
            }
            trk_used[ti] = true;
            det_used[di] = true;

            let entry = &mut self.tracks[ti];
            entry.tracklet.push(tick, detections[di].bbox);
            if let Some(feature) = &detections[di].feature {
                entry.tracklet.add_embedding(feature);
            }
            entry.hits += 1;
            entry.misses = 0;
            if entry.hits >= self.min_hits {
                entry.confirmed = true;
            }
        }

        // Unmatched tracks coast; drop them past the miss budget.
        for (ti, entry) in self.tracks.iter_mut().enumerate() {
            if !trk_used[ti] {
                entry.misses += 1;
            }
        }
        let max_misses = self.max_misses;
        self.tracks.retain(|entry| entry.misses <= max_misses);

        // Unmatched detections seed new tracks.
        for (di, det) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            let mut tracklet = Tracklet::new(self.camera, self.next_id);
            self.next_id += 1;
            tracklet.push(tick, det.bbox);
            if let Some(feature) = &det.feature {
                tracklet.add_embedding(feature);
            }
            self.tracks.push(TrackEntry {
                tracklet,
                hits: 1,
                misses: 0,
                confirmed: self.min_hits == 1,
            });
        }

        self.tracks
            .iter()
            .filter(|e| e.confirmed && e.misses == 0 && e.tracklet.last_tick() == Some(tick))
            .map(|e| e.tracklet.clone())
            .collect()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}
