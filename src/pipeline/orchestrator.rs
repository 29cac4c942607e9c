// src/pipeline/orchestrator.rs
//
// Wires the whole system together: one worker thread per camera, the
// shared virtual clock, the identity aggregator, and the async MJPEG
// server. Owns startup order (all sources must open before anything
// runs) and shutdown order (workers, clock, hub, server).

use crate::aggregator::IdentityAggregator;
use crate::broadcast::{self, BroadcastHub};
use crate::camera_worker::{CameraWorker, WorkerContext};
use crate::clock::VirtualClock;
use crate::clustering::{AgglomerativeClusterer, Linkage};
use crate::detector::YoloDetector;
use crate::layout::CameraLayout;
use crate::pipeline::metrics::PipelineMetrics;
use crate::reid::OnnxExtractor;
use crate::tracker::IouTracker;
use crate::types::Config;
use crate::video::{FrameSource, VideoReader};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct PipelineOrchestrator {
    config: Config,
}

impl PipelineOrchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let metrics = Arc::new(PipelineMetrics::new());

        // Open every source up front; a camera that cannot open is a
        // configuration error, not something to limp along without.
        let mut sources: Vec<Box<dyn FrameSource>> = Vec::with_capacity(config.cameras.len());
        for cam in &config.cameras {
            let reader = VideoReader::open(&cam.video)
                .with_context(|| format!("camera {}", cam.name))?;
            sources.push(Box::new(reader));
        }
        info!("✓ {} camera source(s) opened", sources.len());

        let source_rates: Vec<f64> = sources.iter().map(|s| s.frame_rate()).collect();
        let layout = CameraLayout::new(
            &config.cameras,
            &source_rates,
            config.clustering.max_gap_secs,
        );

        let clock = Arc::new(VirtualClock::new(
            Duration::from_secs_f64(config.clock.tick_interval_secs),
            config.clock.max_skew_ticks,
            Duration::from_secs_f64(config.clock.stall_secs),
        ));

        let linkage = Linkage::parse(&config.clustering.linkage)?;
        let aggregator = Arc::new(IdentityAggregator::new(
            &config.clustering,
            layout.clone(),
            Box::new(AgglomerativeClusterer::new(
                config.clustering.min_similarity,
                linkage,
            )),
            Arc::clone(&metrics),
        ));
        info!("✓ Identity aggregator ready ({} linkage)", config.clustering.linkage);

        let target_interval = Duration::from_secs_f64(1.0 / config.live.target_fps);
        let hub = Arc::new(BroadcastHub::new(target_interval, Arc::clone(&metrics)));

        let layout = Arc::new(layout);
        let tracked_classes: HashSet<usize> =
            config.detection.tracked_classes.iter().copied().collect();

        let mut workers = Vec::with_capacity(config.cameras.len());
        for (camera, (cam, source)) in config.cameras.iter().zip(sources).enumerate() {
            // each worker gets its own sessions so inference never
            // serializes across cameras
            let detector = YoloDetector::new(
                &config.detection.model_path,
                config.detection.confidence_threshold,
            )?;
            let extractor = OnnxExtractor::new(
                &config.reid.model_path,
                config.reid.input_width,
                config.reid.input_height,
            )?;

            hub.register_channel(&cam.name);
            clock.register(&cam.name);

            workers.push(CameraWorker::new(WorkerContext {
                camera,
                name: cam.name.clone(),
                source,
                detector: Box::new(detector),
                extractor: Box::new(extractor),
                tracker: IouTracker::new(
                    camera,
                    config.detection.tracker_iou_threshold,
                    config.detection.tracker_min_hits,
                    config.detection.tracker_max_misses,
                ),
                layout: Arc::clone(&layout),
                clock: Arc::clone(&clock),
                aggregator: Arc::clone(&aggregator),
                hub: Arc::clone(&hub),
                metrics: Arc::clone(&metrics),
                min_confidence: config.detection.confidence_threshold,
                tracked_classes: tracked_classes.clone(),
                target_interval,
                loop_video: config.live.loop_video,
            }));
        }
        info!("✓ {} camera worker(s) ready", workers.len());

        clock.start()?;

        let mut stop_flags = Vec::with_capacity(workers.len());
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            stop_flags.push(worker.stop_flag());
            let name = worker.name().to_string();
            let handle = thread::Builder::new()
                .name(format!("camera-{name}"))
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn worker thread for {name}"))?;
            handles.push(handle);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(broadcast::serve(
            Arc::clone(&hub),
            Arc::clone(&metrics),
            config.live.port,
            shutdown_rx,
        ));

        // Run until interrupted or every worker has finished on its own
        // (all sources ended with looping disabled).
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if handles.iter().all(|h| h.is_finished()) {
                        info!("All camera workers finished");
                        break;
                    }
                }
            }
        }

        // shutdown order: workers first, then clock, then viewers
        for flag in &stop_flags {
            flag.store(true, Ordering::Relaxed);
        }
        clock.stop();
        for handle in handles {
            if handle.join().is_err() {
                error!("a camera worker panicked");
            }
        }
        hub.shutdown();
        let _ = shutdown_tx.send(true);
        server.await.context("server task panicked")??;

        let summary = metrics.summary();
        info!(
            "Final: tick {}, {} frames processed ({:.1} FPS), {} detections, {} clustering passes ({} failed)",
            clock.current_tick(),
            summary.frames_processed,
            summary.fps,
            summary.detections_total,
            summary.cluster_passes,
            summary.cluster_failures
        );
        Ok(())
    }
}
