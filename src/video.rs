// src/video.rs

use crate::types::Frame;
use anyhow::{bail, Result};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::info;

/// Frame producer consumed by a camera worker. The OpenCV-backed reader is
/// the production implementation; tests substitute synthetic sources.
pub trait FrameSource: Send {
    /// Next frame in BGR, or `None` when the source is exhausted.
    fn read(&mut self) -> Result<Option<Mat>>;
    /// Seek back to the first frame (used when looping is enabled).
    fn rewind(&mut self) -> Result<()>;
    fn frame_rate(&self) -> f64;
}

pub struct VideoReader {
    cap: VideoCapture,
    fps: f64,
    width: i32,
    height: i32,
}

impl VideoReader {
    pub fn open(path: &str) -> Result<Self> {
        info!("Opening video: {}", path);

        let cap = VideoCapture::from_file(path, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            bail!("failed to open video source {path}");
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        info!("Video properties: {}x{} @ {:.1} FPS", width, height, fps);

        Ok(Self {
            cap,
            fps,
            width,
            height,
        })
    }
}

impl FrameSource for VideoReader {
    fn read(&mut self) -> Result<Option<Mat>> {
        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }
        Ok(Some(mat))
    }

    fn rewind(&mut self) -> Result<()> {
        self.cap.set(videoio::CAP_PROP_POS_FRAMES, 0.0)?;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }
}

/// Convert a BGR Mat into the packed-RGB `Frame` the inference pipeline
/// consumes.
pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let data = rgb.data_bytes()?.to_vec();
    Ok(Frame {
        data,
        width: mat.cols() as usize,
        height: mat.rows() as usize,
    })
}
