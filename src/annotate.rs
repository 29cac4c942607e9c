// src/annotate.rs

use crate::track::{IdentityMap, Tracklet};
use anyhow::Result;
use opencv::{
    core::{Mat, Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};

/// Label shown while a track has no global identity yet.
const UNRESOLVED: i64 = -1;

/// Deterministic pseudo-random color per global id, BGR.
pub fn color_for_gid(gid: i64) -> Scalar {
    if gid == UNRESOLVED {
        return Scalar::new(128.0, 128.0, 128.0, 0.0);
    }
    let r = (37 * gid + 17).rem_euclid(256) as f64;
    let g = (17 * gid + 101).rem_euclid(256) as f64;
    let b = (97 * gid + 53).rem_euclid(256) as f64;
    Scalar::new(b, g, r, 0.0)
}

/// Draw each track's latest box labeled with its resolved global id, plus
/// the current tick in the corner.
pub fn draw_tracks(
    canvas: &mut Mat,
    tracks: &[Tracklet],
    ids: &IdentityMap,
    tick: u64,
) -> Result<()> {
    for track in tracks {
        let Some(bbox) = track.last_box() else {
            continue;
        };
        let gid = ids
            .get(&track.local_id)
            .map(|g| *g as i64)
            .unwrap_or(UNRESOLVED);
        let color = color_for_gid(gid);

        let rect = Rect::new(
            bbox[0] as i32,
            bbox[1] as i32,
            bbox[2] as i32,
            bbox[3] as i32,
        );
        imgproc::rectangle(canvas, rect, color, 2, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            canvas,
            &gid.to_string(),
            Point::new(rect.x, rect.y - 6),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.7,
            color,
            2,
            imgproc::LINE_AA,
            false,
        )?;
    }

    imgproc::put_text(
        canvas,
        &format!("t={tick}"),
        Point::new(8, 24),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        2,
        imgproc::LINE_AA,
        false,
    )?;
    Ok(())
}

pub fn encode_jpeg(mat: &Mat) -> Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", mat, &mut buf, &Vector::<i32>::new())?;
    Ok(buf.to_vec())
}
