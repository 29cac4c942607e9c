// src/aggregator.rs
//
// Cross-camera identity aggregation. Workers submit their latest tracklet
// snapshots; a rate-limited clustering pass partitions the combined set
// into global identities and publishes one local-id -> global-id map per
// camera. Reads are copy-on-write: submitting never waits for a pass in
// progress, it returns whatever map is currently published.

use crate::clustering::Clusterer;
use crate::layout::CameraLayout;
use crate::pipeline::metrics::PipelineMetrics;
use crate::track::{GlobalTrack, IdentityMap, TrackKey, Tracklet};
use crate::types::ClusteringConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct AggState {
    /// Latest tracklet snapshot per camera; newer submissions overwrite.
    snapshots: HashMap<usize, Vec<Tracklet>>,
    last_pass: Option<Instant>,
    next_gid: u64,
    /// Membership of the previous pass, used for best-effort id reuse.
    prev_assignment: HashMap<TrackKey, u64>,
    /// Clusters published by the most recent successful pass.
    global_tracks: Vec<GlobalTrack>,
}

pub struct IdentityAggregator {
    min_track_frames: usize,
    recluster_interval: Duration,
    max_tracklets: usize,
    layout: CameraLayout,
    clusterer: Box<dyn Clusterer>,
    metrics: Arc<PipelineMetrics>,
    state: Mutex<AggState>,
    published: RwLock<HashMap<usize, Arc<IdentityMap>>>,
    /// Serializes recompute passes; contenders skip instead of blocking.
    recompute_gate: Mutex<()>,
}

impl IdentityAggregator {
    pub fn new(
        config: &ClusteringConfig,
        layout: CameraLayout,
        clusterer: Box<dyn Clusterer>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            min_track_frames: config.min_track_frames,
            recluster_interval: Duration::from_secs_f64(config.recluster_interval_secs),
            max_tracklets: config.max_tracklets,
            layout,
            clusterer,
            metrics,
            state: Mutex::new(AggState {
                snapshots: HashMap::new(),
                last_pass: None,
                next_gid: 1,
                prev_assignment: HashMap::new(),
                global_tracks: Vec::new(),
            }),
            published: RwLock::new(HashMap::new()),
            recompute_gate: Mutex::new(()),
        }
    }

    /// Overwrite this camera's snapshot, recompute if due, and return the
    /// currently published map (possibly one pass stale).
    pub fn submit(&self, camera: usize, tracklets: Vec<Tracklet>) -> Arc<IdentityMap> {
        self.metrics
            .add(&self.metrics.tracklets_submitted, tracklets.len() as u64);
        let due = {
            let mut st = self.state.lock();
            st.snapshots.insert(camera, tracklets);
            match st.last_pass {
                None => true,
                Some(at) => at.elapsed() >= self.recluster_interval,
            }
        };
        if due {
            self.recompute();
        }
        self.current_map(camera)
    }

    pub fn current_map(&self, camera: usize) -> Arc<IdentityMap> {
        self.published
            .read()
            .get(&camera)
            .cloned()
            .unwrap_or_default()
    }

    /// One clustering pass over the latest snapshots. Never runs
    /// concurrently with itself; a contending caller returns immediately.
    pub fn recompute(&self) {
        let Some(_gate) = self.recompute_gate.try_lock() else {
            return;
        };

        // Snapshot under the lock, cluster outside it.
        let (mut combined, cameras, prev_assignment, mut next_gid) = {
            let mut st = self.state.lock();
            st.last_pass = Some(Instant::now());
            let cameras: Vec<usize> = st.snapshots.keys().copied().collect();
            let combined: Vec<Tracklet> = st
                .snapshots
                .values()
                .flatten()
                .filter(|t| t.len() >= self.min_track_frames)
                .cloned()
                .collect();
            (combined, cameras, st.prev_assignment.clone(), st.next_gid)
        };

        if self.max_tracklets > 0 && combined.len() > self.max_tracklets {
            // Bound the clustering cost: keep the most recent tracklets.
            combined.sort_by(|a, b| {
                b.global_end
                    .partial_cmp(&a.global_end)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            combined.truncate(self.max_tracklets);
        }

        let mut maps: HashMap<usize, IdentityMap> =
            cameras.iter().map(|&c| (c, IdentityMap::new())).collect();

        if combined.is_empty() {
            self.publish(maps);
            self.metrics.inc(&self.metrics.cluster_passes);
            return;
        }

        let partition = match self.clusterer.cluster(&combined, &self.layout) {
            Ok(partition) => partition,
            Err(err) => {
                warn!("clustering pass failed, keeping last-good maps: {err:#}");
                self.metrics.inc(&self.metrics.cluster_failures);
                return;
            }
        };

        // Deterministic cluster order: earliest on the shared timeline
        // first, ties broken by member keys.
        let mut ordered: Vec<Vec<usize>> = partition;
        ordered.sort_by(|a, b| {
            let start = |c: &Vec<usize>| {
                c.iter()
                    .map(|&i| combined[i].global_start)
                    .fold(f64::INFINITY, f64::min)
            };
            let key = |c: &Vec<usize>| c.iter().map(|&i| combined[i].key()).min();
            start(a)
                .partial_cmp(&start(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| key(a).cmp(&key(b)))
        });

        let mut assignment: HashMap<TrackKey, u64> = HashMap::new();
        let mut used_gids: Vec<u64> = Vec::new();
        let mut global_tracks: Vec<GlobalTrack> = Vec::with_capacity(ordered.len());
        for cluster in &ordered {
            let keys: Vec<TrackKey> = cluster.iter().map(|&i| combined[i].key()).collect();

            // Best-effort stability: reuse the previous gid when the
            // cluster's members agree on exactly one and no other cluster
            // claimed it this pass.
            let mut candidates: Vec<u64> = keys
                .iter()
                .filter_map(|k| prev_assignment.get(k).copied())
                .collect();
            candidates.sort_unstable();
            candidates.dedup();

            let gid = match candidates.as_slice() {
                [gid] if !used_gids.contains(gid) => *gid,
                _ => {
                    let gid = next_gid;
                    next_gid += 1;
                    gid
                }
            };
            used_gids.push(gid);

            for key in &keys {
                assignment.insert(*key, gid);
                maps.entry(key.0).or_default().insert(key.1, gid);
            }
            global_tracks.push(GlobalTrack {
                global_id: gid,
                members: keys,
            });
        }

        {
            let mut st = self.state.lock();
            st.prev_assignment = assignment;
            st.next_gid = next_gid;
            st.global_tracks = global_tracks;
        }
        self.publish(maps);
        self.metrics.inc(&self.metrics.cluster_passes);
        debug!("clustering pass published {} global tracks", ordered.len());
    }

    /// Clusters from the most recent successful pass.
    pub fn global_tracks(&self) -> Vec<GlobalTrack> {
        self.state.lock().global_tracks.clone()
    }

    fn publish(&self, maps: HashMap<usize, IdentityMap>) {
        let fresh: HashMap<usize, Arc<IdentityMap>> =
            maps.into_iter().map(|(c, m)| (c, Arc::new(m))).collect();
        *self.published.write() = fresh;
    }
}
