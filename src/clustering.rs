// src/clustering.rs
//
// Agglomerative clustering of tracklets into global identities. The
// pairwise score is appearance cosine similarity, gated by hard
// constraints: two tracklets observed at overlapping ticks on the same
// camera can never be the same physical object, and cross-camera pairs
// must be temporally compatible per the camera layout.

use crate::layout::CameraLayout;
use crate::track::Tracklet;
use anyhow::{bail, Result};

/// Score used for pairs that must never end up in one cluster.
const FORBIDDEN: f32 = f32::NEG_INFINITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Single,
    Average,
    Complete,
}

impl Linkage {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "single" => Ok(Linkage::Single),
            "average" => Ok(Linkage::Average),
            "complete" => Ok(Linkage::Complete),
            other => bail!("unknown linkage {other}"),
        }
    }
}

/// Clustering collaborator consumed by the aggregator. Output is a
/// partition of tracklet indices; every input index appears exactly once.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, tracklets: &[Tracklet], layout: &CameraLayout) -> Result<Vec<Vec<usize>>>;
}

pub struct AgglomerativeClusterer {
    min_sim: f32,
    linkage: Linkage,
}

impl AgglomerativeClusterer {
    pub fn new(min_sim: f32, linkage: Linkage) -> Self {
        Self { min_sim, linkage }
    }

    fn pairwise(&self, tracklets: &[Tracklet], layout: &CameraLayout) -> Vec<Vec<f32>> {
        let n = tracklets.len();
        let mut sim = vec![vec![0.0f32; n]; n];
        let embeddings: Vec<Option<Vec<f32>>> =
            tracklets.iter().map(|t| t.mean_embedding()).collect();

        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (&tracklets[i], &tracklets[j]);
                let score = if a.camera == b.camera && a.ticks_overlap(b) {
                    FORBIDDEN
                } else if !layout.compatible(a, b) {
                    FORBIDDEN
                } else {
                    match (&embeddings[i], &embeddings[j]) {
                        (Some(ea), Some(eb)) => cosine_similarity(ea, eb),
                        _ => -1.0,
                    }
                };
                sim[i][j] = score;
                sim[j][i] = score;
            }
        }
        sim
    }

    fn link_score(&self, sim: &[Vec<f32>], a: &[usize], b: &[usize]) -> f32 {
        let mut best = f32::NEG_INFINITY;
        let mut worst = f32::INFINITY;
        let mut sum = 0.0f64;
        for &i in a {
            for &j in b {
                let s = sim[i][j];
                if s == FORBIDDEN {
                    // one forbidden pair poisons the whole merge
                    return FORBIDDEN;
                }
                best = best.max(s);
                worst = worst.min(s);
                sum += s as f64;
            }
        }
        match self.linkage {
            Linkage::Single => best,
            Linkage::Complete => worst,
            Linkage::Average => (sum / (a.len() * b.len()) as f64) as f32,
        }
    }
}

impl Clusterer for AgglomerativeClusterer {
    fn cluster(&self, tracklets: &[Tracklet], layout: &CameraLayout) -> Result<Vec<Vec<usize>>> {
        let n = tracklets.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let sim = self.pairwise(tracklets, layout);

        let mut clusters: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_pair: Option<(usize, usize)> = None;
            for i in 0..n {
                let Some(a) = &clusters[i] else { continue };
                for j in (i + 1)..n {
                    let Some(b) = &clusters[j] else { continue };
                    let score = self.link_score(&sim, a, b);
                    // strict comparison: ties resolve to the lowest indices
                    if score > best_score {
                        best_score = score;
                        best_pair = Some((i, j));
                    }
                }
            }

            let Some((i, j)) = best_pair else { break };
            if best_score < self.min_sim {
                break;
            }
            let merged = clusters[j].take().unwrap_or_default();
            if let Some(target) = clusters[i].as_mut() {
                target.extend(merged);
                target.sort_unstable();
            }
        }

        Ok(clusters.into_iter().flatten().collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return -1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    dot / (na * nb + 1e-12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CameraConfig;

    fn layout(n: usize) -> CameraLayout {
        let cams: Vec<CameraConfig> = (0..n)
            .map(|i| CameraConfig {
                name: format!("cam_{i}"),
                video: String::new(),
                frame_rate: Some(10.0),
                time_scale: 1.0,
                time_offset: 0.0,
            })
            .collect();
        CameraLayout::new(&cams, &[], 10.0)
    }

    fn tracklet(camera: usize, local_id: u64, ticks: std::ops::Range<u64>, emb: &[f32]) -> Tracklet {
        let mut t = Tracklet::new(camera, local_id);
        for tick in ticks {
            t.push(tick, [0.0, 0.0, 10.0, 10.0]);
        }
        t.add_embedding(emb);
        t
    }

    fn clustered_together(partition: &[Vec<usize>], a: usize, b: usize) -> bool {
        partition.iter().any(|c| c.contains(&a) && c.contains(&b))
    }

    #[test]
    fn merges_similar_cross_camera_tracklets() {
        let lay = layout(2);
        let mut a = tracklet(0, 1, 0..20, &[1.0, 0.0, 0.2]);
        let mut b = tracklet(1, 7, 25..40, &[0.9, 0.05, 0.25]);
        lay.project_tracklet(&mut a);
        lay.project_tracklet(&mut b);

        let clusterer = AgglomerativeClusterer::new(0.5, Linkage::Average);
        let partition = clusterer.cluster(&[a, b], &lay).unwrap();
        assert_eq!(partition.len(), 1);
    }

    #[test]
    fn never_merges_overlapping_same_camera_tracklets() {
        let lay = layout(1);
        // identical embeddings, overlapping ticks on one camera
        let mut a = tracklet(0, 1, 0..20, &[1.0, 0.0]);
        let mut b = tracklet(0, 2, 10..30, &[1.0, 0.0]);
        lay.project_tracklet(&mut a);
        lay.project_tracklet(&mut b);

        let clusterer = AgglomerativeClusterer::new(0.1, Linkage::Single);
        let partition = clusterer.cluster(&[a, b], &lay).unwrap();
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn forbidden_pair_poisons_transitive_merge() {
        let lay = layout(2);
        // a and b overlap on camera 0; c on camera 1 is similar to both.
        // c may join one of them, but a and b must stay apart.
        let mut a = tracklet(0, 1, 0..20, &[1.0, 0.0]);
        let mut b = tracklet(0, 2, 10..30, &[1.0, 0.0]);
        let mut c = tracklet(1, 3, 15..25, &[1.0, 0.0]);
        lay.project_tracklet(&mut a);
        lay.project_tracklet(&mut b);
        lay.project_tracklet(&mut c);

        let clusterer = AgglomerativeClusterer::new(0.5, Linkage::Single);
        let partition = clusterer.cluster(&[a, b, c], &lay).unwrap();
        assert!(!clustered_together(&partition, 0, 1));
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn temporally_incompatible_tracklets_stay_apart() {
        let lay = layout(2);
        let mut a = tracklet(0, 1, 0..10, &[1.0, 0.0]);
        let mut b = tracklet(1, 2, 500..510, &[1.0, 0.0]);
        lay.project_tracklet(&mut a);
        lay.project_tracklet(&mut b);

        let clusterer = AgglomerativeClusterer::new(0.5, Linkage::Average);
        let partition = clusterer.cluster(&[a, b], &lay).unwrap();
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn dissimilar_embeddings_stay_apart() {
        let lay = layout(2);
        let mut a = tracklet(0, 1, 0..10, &[1.0, 0.0]);
        let mut b = tracklet(1, 2, 12..20, &[0.0, 1.0]);
        lay.project_tracklet(&mut a);
        lay.project_tracklet(&mut b);

        let clusterer = AgglomerativeClusterer::new(0.5, Linkage::Average);
        let partition = clusterer.cluster(&[a, b], &lay).unwrap();
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn clustering_is_deterministic() {
        let lay = layout(3);
        let mut tracklets = Vec::new();
        for cam in 0..3 {
            for id in 0..3u64 {
                let base = cam as u64 * 3 + id;
                let mut t = tracklet(
                    cam,
                    id + 1,
                    base * 5..base * 5 + 10,
                    &[1.0 - 0.1 * id as f32, 0.1 * cam as f32, 0.3],
                );
                lay.project_tracklet(&mut t);
                tracklets.push(t);
            }
        }
        let clusterer = AgglomerativeClusterer::new(0.6, Linkage::Average);
        let first = clusterer.cluster(&tracklets, &lay).unwrap();
        let second = clusterer.cluster(&tracklets, &lay).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn parses_linkage_names() {
        assert_eq!(Linkage::parse("single").unwrap(), Linkage::Single);
        assert_eq!(Linkage::parse("average").unwrap(), Linkage::Average);
        assert_eq!(Linkage::parse("complete").unwrap(), Linkage::Complete);
        assert!(Linkage::parse("ward").is_err());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-5);
        assert_eq!(cosine_similarity(&[], &[]), -1.0);
    }
}
