// src/camera_worker.rs
//
// One worker per camera: paced by the virtual clock, it decodes a frame,
// runs detect -> embed -> track, submits its tracklets for global identity
// resolution, and publishes the annotated frame to the broadcast hub.

use crate::aggregator::IdentityAggregator;
use crate::annotate::{draw_tracks, encode_jpeg};
use crate::broadcast::BroadcastHub;
use crate::clock::VirtualClock;
use crate::detector::{Detection, Detector};
use crate::layout::CameraLayout;
use crate::pipeline::metrics::PipelineMetrics;
use crate::reid::FeatureExtractor;
use crate::track::{IdentityMap, Tracklet};
use crate::tracker::IouTracker;
use crate::video::{mat_to_frame, FrameSource};
use anyhow::Result;
use bytes::Bytes;
use opencv::core::Mat;
use opencv::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Everything a worker needs, wired by the orchestrator.
pub struct WorkerContext {
    pub camera: usize,
    pub name: String,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    pub extractor: Box<dyn FeatureExtractor>,
    pub tracker: IouTracker,
    pub layout: Arc<CameraLayout>,
    pub clock: Arc<VirtualClock>,
    pub aggregator: Arc<IdentityAggregator>,
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<PipelineMetrics>,
    pub min_confidence: f32,
    pub tracked_classes: HashSet<usize>,
    pub target_interval: Duration,
    pub loop_video: bool,
}

pub struct CameraWorker {
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
    last_tick: u64,
    last_emit: Instant,
    /// Accumulated local -> global resolutions, so labels survive between
    /// clustering passes.
    local_to_global: IdentityMap,
}

impl CameraWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            stop: Arc::new(AtomicBool::new(false)),
            last_tick: 0,
            last_emit: Instant::now(),
            local_to_global: IdentityMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Flag shared with the orchestrator to request a stop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn run(mut self) {
        info!("Starting camera worker {}", self.ctx.name);
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(tick) = self.ctx.clock.wait_for_tick(&self.ctx.name, self.last_tick) else {
                break;
            };

            let mat = match self.ctx.source.read() {
                Ok(Some(mat)) => mat,
                Ok(None) => {
                    if self.ctx.loop_video {
                        if let Err(err) = self.ctx.source.rewind() {
                            warn!("camera {}: rewind failed: {err:#}", self.ctx.name);
                            break;
                        }
                        self.consume_tick(tick);
                        continue;
                    }
                    info!("Camera {} ended", self.ctx.name);
                    break;
                }
                Err(err) => {
                    // one bad frame is not fatal; skip the tick
                    warn!("camera {}: decode error: {err:#}", self.ctx.name);
                    self.ctx.metrics.inc(&self.ctx.metrics.transient_errors);
                    self.consume_tick(tick);
                    continue;
                }
            };

            let tracks = match self.process_frame(tick, &mat) {
                Ok(tracks) => tracks,
                Err(err) => {
                    warn!(
                        "camera {}: pipeline error at tick {tick}, treating as no detections: {err:#}",
                        self.ctx.name
                    );
                    self.ctx.metrics.inc(&self.ctx.metrics.transient_errors);
                    Vec::new()
                }
            };

            if let Err(err) = self.publish_frame(&mat, &tracks, tick) {
                warn!("camera {}: failed to publish frame: {err:#}", self.ctx.name);
                self.ctx.metrics.inc(&self.ctx.metrics.transient_errors);
            }

            self.pace();
            self.consume_tick(tick);
            self.ctx.metrics.inc(&self.ctx.metrics.frames_processed);
        }
        self.ctx.clock.retire(&self.ctx.name);
        info!("Camera worker {} stopped", self.ctx.name);
    }

    fn consume_tick(&mut self, tick: u64) {
        self.last_tick = tick;
        self.ctx.clock.mark(&self.ctx.name, tick);
    }

    fn process_frame(&mut self, tick: u64, mat: &Mat) -> Result<Vec<Tracklet>> {
        let frame = mat_to_frame(mat)?;

        // A detector failure is an empty detection set, not an aborted
        // tick: live tracks must keep accruing misses and the camera's
        // snapshot must keep shrinking while the model is down.
        let detections = match self.ctx.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                warn!("camera {}: detection failed: {err:#}", self.ctx.name);
                self.ctx.metrics.inc(&self.ctx.metrics.transient_errors);
                Vec::new()
            }
        };
        let mut filtered: Vec<Detection> = detections
            .into_iter()
            .filter(|d| {
                d.confidence >= self.ctx.min_confidence
                    && self.ctx.tracked_classes.contains(&d.class_id)
            })
            .collect();
        self.ctx
            .metrics
            .add(&self.ctx.metrics.detections_total, filtered.len() as u64);

        if !filtered.is_empty() {
            let boxes: Vec<[f32; 4]> = filtered.iter().map(|d| d.bbox).collect();
            match self.ctx.extractor.extract(&frame, &boxes) {
                Ok(features) => {
                    for (det, feature) in filtered.iter_mut().zip(features) {
                        det.feature = Some(feature);
                    }
                }
                Err(err) => {
                    // tracks still advance on IOU alone this tick
                    warn!("camera {}: embedding failed: {err:#}", self.ctx.name);
                    self.ctx.metrics.inc(&self.ctx.metrics.transient_errors);
                }
            }
        }

        let mut tracks = self.ctx.tracker.update(tick, &filtered);
        for track in &mut tracks {
            self.ctx.layout.project_tracklet(track);
        }

        let map = self.ctx.aggregator.submit(self.ctx.camera, tracks.clone());
        for (lid, gid) in map.iter() {
            self.local_to_global.insert(*lid, *gid);
        }
        Ok(tracks)
    }

    fn publish_frame(&self, mat: &Mat, tracks: &[Tracklet], tick: u64) -> Result<()> {
        let mut canvas = mat.try_clone()?;
        draw_tracks(&mut canvas, tracks, &self.local_to_global, tick)?;
        let jpeg = encode_jpeg(&canvas)?;
        self.ctx.hub.update(&self.ctx.name, Bytes::from(jpeg));
        Ok(())
    }

    /// Keep the published stream near the target fps, independent of (and
    /// no faster than) the clock pace.
    fn pace(&mut self) {
        let elapsed = self.last_emit.elapsed();
        if elapsed < self.ctx.target_interval {
            thread::sleep(self.ctx.target_interval - elapsed);
        }
        self.last_emit = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{AgglomerativeClusterer, Linkage};
    use crate::types::{CameraConfig, ClusteringConfig, Frame};
    use opencv::core::{Scalar, CV_8UC3};

    struct SyntheticSource {
        frames_left: usize,
        total: usize,
    }

    impl FrameSource for SyntheticSource {
        fn read(&mut self) -> Result<Option<Mat>> {
            if self.frames_left == 0 {
                return Ok(None);
            }
            self.frames_left -= 1;
            let mat =
                Mat::new_rows_cols_with_default(120, 160, CV_8UC3, Scalar::all(60.0))?;
            Ok(Some(mat))
        }

        fn rewind(&mut self) -> Result<()> {
            self.frames_left = self.total;
            Ok(())
        }

        fn frame_rate(&self) -> f64 {
            30.0
        }
    }

    struct FakeDetector;

    impl Detector for FakeDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(vec![Detection {
                bbox: [20.0, 20.0, 50.0, 40.0],
                confidence: 0.9,
                class_id: 2,
                feature: None,
            }])
        }
    }

    struct FlakyDetector {
        ok_calls: usize,
        calls: usize,
    }

    impl Detector for FlakyDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls += 1;
            if self.calls <= self.ok_calls {
                Ok(vec![Detection {
                    bbox: [20.0, 20.0, 50.0, 40.0],
                    confidence: 0.9,
                    class_id: 2,
                    feature: None,
                }])
            } else {
                Err(anyhow::anyhow!("sensor offline"))
            }
        }
    }

    struct FakeExtractor;

    impl FeatureExtractor for FakeExtractor {
        fn extract(&mut self, _frame: &Frame, boxes: &[[f32; 4]]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0, 0.0]; boxes.len()])
        }
    }

    fn test_layout() -> Arc<CameraLayout> {
        Arc::new(CameraLayout::new(
            &[CameraConfig {
                name: "cam_0".to_string(),
                video: String::new(),
                frame_rate: Some(30.0),
                time_scale: 1.0,
                time_offset: 0.0,
            }],
            &[],
            10.0,
        ))
    }

    fn test_aggregator(metrics: Arc<PipelineMetrics>) -> Arc<IdentityAggregator> {
        Arc::new(IdentityAggregator::new(
            &ClusteringConfig {
                min_similarity: 0.5,
                linkage: "average".to_string(),
                min_track_frames: 3,
                recluster_interval_secs: 0.0,
                max_gap_secs: 10.0,
                max_tracklets: 0,
            },
            CameraLayout::new(
                &[CameraConfig {
                    name: "cam_0".to_string(),
                    video: String::new(),
                    frame_rate: Some(30.0),
                    time_scale: 1.0,
                    time_offset: 0.0,
                }],
                &[],
                10.0,
            ),
            Box::new(AgglomerativeClusterer::new(0.5, Linkage::Average)),
            metrics,
        ))
    }

    fn build_worker(
        source: SyntheticSource,
        clock: Arc<VirtualClock>,
        hub: Arc<BroadcastHub>,
        aggregator: Arc<IdentityAggregator>,
        metrics: Arc<PipelineMetrics>,
        loop_video: bool,
    ) -> CameraWorker {
        CameraWorker::new(WorkerContext {
            camera: 0,
            name: "cam_0".to_string(),
            source: Box::new(source),
            detector: Box::new(FakeDetector),
            extractor: Box::new(FakeExtractor),
            tracker: IouTracker::new(0, 0.3, 2, 5),
            layout: test_layout(),
            clock,
            aggregator,
            hub,
            metrics,
            min_confidence: 0.4,
            tracked_classes: HashSet::from([2]),
            target_interval: Duration::from_millis(1),
            loop_video,
        })
    }

    #[test]
    fn detector_outage_ages_out_tracks() {
        let metrics = Arc::new(PipelineMetrics::new());
        let clock = Arc::new(VirtualClock::new(
            Duration::from_millis(2),
            100,
            Duration::from_secs(60),
        ));
        let hub = Arc::new(BroadcastHub::new(
            Duration::from_millis(10),
            metrics.clone(),
        ));
        let aggregator = test_aggregator(metrics.clone());

        let mut worker = CameraWorker::new(WorkerContext {
            camera: 0,
            name: "cam_0".to_string(),
            source: Box::new(SyntheticSource {
                frames_left: 0,
                total: 0,
            }),
            detector: Box::new(FlakyDetector {
                ok_calls: 5,
                calls: 0,
            }),
            extractor: Box::new(FakeExtractor),
            tracker: IouTracker::new(0, 0.3, 1, 2),
            layout: test_layout(),
            clock,
            aggregator: Arc::clone(&aggregator),
            hub,
            metrics: metrics.clone(),
            min_confidence: 0.4,
            tracked_classes: HashSet::from([2]),
            target_interval: Duration::from_millis(1),
            loop_video: false,
        });
        let mat =
            Mat::new_rows_cols_with_default(120, 160, CV_8UC3, Scalar::all(60.0)).unwrap();

        for tick in 1..=5 {
            worker.process_frame(tick, &mat).unwrap();
        }
        assert!(!aggregator.current_map(0).is_empty());

        // detector is down from here on: each tick still runs the
        // tracker and resubmits, so the track is dropped and the map empties
        for tick in 6..=9 {
            let tracks = worker.process_frame(tick, &mat).unwrap();
            assert!(tracks.is_empty());
        }
        assert_eq!(worker.ctx.tracker.live_tracks(), 0);
        assert!(aggregator.current_map(0).is_empty());
        assert!(metrics.transient_errors.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn worker_publishes_frames_and_resolves_global_ids() {
        let metrics = Arc::new(PipelineMetrics::new());
        let clock = Arc::new(VirtualClock::new(
            Duration::from_millis(2),
            100,
            Duration::from_secs(60),
        ));
        clock.register("cam_0");
        clock.start().unwrap();
        let hub = Arc::new(BroadcastHub::new(
            Duration::from_millis(10),
            metrics.clone(),
        ));
        hub.register_channel("cam_0");
        let aggregator = test_aggregator(metrics.clone());

        let worker = build_worker(
            SyntheticSource {
                frames_left: 10_000,
                total: 10_000,
            },
            Arc::clone(&clock),
            Arc::clone(&hub),
            Arc::clone(&aggregator),
            metrics.clone(),
            true,
        );
        let stop = worker.stop_flag();
        let handle = thread::spawn(move || worker.run());

        // let it chew through a few ticks
        thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::Relaxed);
        clock.stop();
        handle.join().unwrap();

        let frame = hub.latest("cam_0").expect("no frame published");
        assert_eq!(&frame[0..2], &[0xFF, 0xD8], "expected a JPEG frame");

        let map = aggregator.current_map(0);
        assert!(
            map.values().next().is_some(),
            "expected a global id for the tracked object"
        );
        assert!(metrics.frames_processed.load(Ordering::Relaxed) > 3);
    }

    #[test]
    fn worker_stops_and_retires_when_source_ends() {
        let metrics = Arc::new(PipelineMetrics::new());
        let clock = Arc::new(VirtualClock::new(
            Duration::from_millis(2),
            100,
            Duration::from_secs(60),
        ));
        clock.register("cam_0");
        clock.start().unwrap();
        let hub = Arc::new(BroadcastHub::new(
            Duration::from_millis(10),
            metrics.clone(),
        ));
        hub.register_channel("cam_0");
        let aggregator = test_aggregator(metrics.clone());

        let worker = build_worker(
            SyntheticSource {
                frames_left: 3,
                total: 3,
            },
            Arc::clone(&clock),
            Arc::clone(&hub),
            aggregator,
            metrics,
            false,
        );
        let handle = thread::spawn(move || worker.run());
        handle.join().unwrap();

        assert_eq!(clock.active_workers(), 0, "worker did not retire");
        clock.stop();
    }
}
