//! Descriptor matching between a query image and database views.

use std::collections::HashMap;

use nalgebra as na;

use crate::camera::Intrinsics;
use crate::database::{DatabaseView, SceneDatabase};
use crate::features::Regions;
use crate::types::Pose3;

/// 2D observation in the query image matched to a 3D scene point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Query feature, `None` for marker corners.
    pub feature_index: Option<usize>,
    pub point_id: u32,
    pub p2d: na::Vector2<f64>,
    pub p3d: na::Vector3<f64>,
    /// Higher is better, in `[0, 1]`.
    pub score: f32,
}

impl Correspondence {
    pub fn is_marker(&self) -> bool {
        self.feature_index.is_none()
    }

    /// Scene points and marker corners number their ids independently.
    fn target(&self) -> (bool, u32) {
        (self.is_marker(), self.point_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub distance_ratio: f32,
    /// Correspondences kept per view, 0 keeps all.
    pub max_results: usize,
}

pub fn distance2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Nearest and second nearest candidate of `query` among `candidates`,
/// as `(index, best distance^2, second distance^2)`.
fn two_nearest<'a>(
    query: &[f32],
    candidates: impl Iterator<Item = (usize, &'a [f32])>,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32)> = None;
    let mut second = f32::INFINITY;
    for (i, desc) in candidates {
        let d = distance2(query, desc);
        match best {
            Some((_, bd)) if d >= bd => second = second.min(d),
            Some((_, bd)) => {
                second = bd;
                best = Some((i, d));
            }
            None => best = Some((i, d)),
        }
    }
    best.map(|(i, d)| (i, d, second))
}

/// Ratio test on squared distances: accept when `best < ratio * second`
/// in descriptor distance. Returns the match score.
fn ratio_test(best2: f32, second2: f32, ratio: f32) -> Option<f32> {
    if second2.is_infinite() {
        return Some(1.0);
    }
    if best2 < ratio * ratio * second2 {
        let s = if second2 > 0.0 {
            1.0 - (best2 / second2).sqrt()
        } else {
            0.0
        };
        Some(s)
    } else {
        None
    }
}

fn cap_per_point(mut matches: Vec<Correspondence>, max_results: usize) -> Vec<Correspondence> {
    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.feature_index.cmp(&b.feature_index))
    });
    let mut seen_points = HashMap::new();
    matches.retain(|c| seen_points.insert(c.point_id, ()).is_none());
    if max_results > 0 {
        matches.truncate(max_results);
    }
    matches
}

/// Blind matching of every query descriptor against one database view.
///
/// The ratio test runs within the view's descriptors and a scene point is
/// matched at most once.
pub fn match_view(
    query: &Regions,
    view: &DatabaseView,
    database: &SceneDatabase,
    options: &MatchOptions,
) -> Vec<Correspondence> {
    if view.features.len() < 2 || query.descriptors.is_empty() {
        return Vec::new();
    }
    let matches: Vec<Correspondence> = query
        .descriptors
        .iter()
        .enumerate()
        .filter_map(|(qi, qd)| {
            let (vi, d1, d2) = two_nearest(
                qd,
                view.features
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (i, f.descriptor.as_slice())),
            )?;
            let score = ratio_test(d1, d2, options.distance_ratio)?;
            let point_id = view.features[vi].point_id;
            Some(Correspondence {
                feature_index: Some(qi),
                point_id,
                p2d: query.point(qi),
                p3d: *database.point(point_id)?,
                score,
            })
        })
        .collect();
    cap_per_point(matches, options.max_results)
}

/// Second pass matching constrained by a pose estimate.
///
/// Every point observed in the candidate views is projected with `pose`;
/// the ratio test then only runs among query features inside
/// `search_radius` pixels of the prediction. A point with a single
/// feature in its window is accepted on its own.
pub fn guided_match(
    query: &Regions,
    views: &[&DatabaseView],
    database: &SceneDatabase,
    pose: &Pose3,
    intrinsics: &Intrinsics,
    search_radius: f64,
    options: &MatchOptions,
) -> Vec<Correspondence> {
    let radius2 = search_radius * search_radius;
    let mut matches = Vec::new();
    let mut visited = HashMap::new();
    for view in views {
        for vf in &view.features {
            if visited.insert(vf.point_id, ()).is_some() {
                continue;
            }
            let Some(p3d) = database.point(vf.point_id) else {
                continue;
            };
            let Some(predicted) = intrinsics.project_world(pose, p3d) else {
                continue;
            };
            if !intrinsics.contains(&predicted) {
                continue;
            }
            let window = query.features.iter().enumerate().filter_map(|(qi, f)| {
                let dx = f.x as f64 - predicted.x;
                let dy = f.y as f64 - predicted.y;
                (dx * dx + dy * dy <= radius2).then(|| (qi, query.descriptors[qi].as_slice()))
            });
            let Some((qi, d1, d2)) = two_nearest(&vf.descriptor, window) else {
                continue;
            };
            let Some(score) = ratio_test(d1, d2, options.distance_ratio) else {
                continue;
            };
            matches.push(Correspondence {
                feature_index: Some(qi),
                point_id: vf.point_id,
                p2d: query.point(qi),
                p3d: *p3d,
                score,
            });
        }
    }
    let mut matches = cap_per_point(matches, 0);
    dedup_features(&mut matches);
    matches
}

/// Keeps the best scored correspondence per query feature.
fn dedup_features(matches: &mut Vec<Correspondence>) {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.point_id.cmp(&b.point_id)));
    let mut seen = HashMap::new();
    matches.retain(|c| match c.feature_index {
        Some(fi) => seen.insert(fi, ()).is_none(),
        None => true,
    });
}

/// Union of two correspondence sets. Each scene point, each marker corner
/// and each query feature appears once, the higher score wins.
pub fn merge_correspondences(
    primary: &[Correspondence],
    extra: &[Correspondence],
) -> Vec<Correspondence> {
    let mut all: Vec<Correspondence> = primary.iter().chain(extra).copied().collect();
    all.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.target().cmp(&b.target())));
    let mut seen_targets = HashMap::new();
    all.retain(|c| seen_targets.insert(c.target(), ()).is_none());
    dedup_features(&mut all);
    all.sort_by_key(|c| (c.feature_index.is_none(), c.feature_index, c.point_id));
    all
}

/// Marker corners with a surveyed position in the database.
pub fn marker_correspondences(query: &Regions, database: &SceneDatabase) -> Vec<Correspondence> {
    query
        .markers
        .iter()
        .filter_map(|m| {
            Some(Correspondence {
                feature_index: None,
                point_id: m.id,
                p2d: m.point,
                p3d: *database.marker(m.id)?,
                score: 1.0,
            })
        })
        .collect()
}
