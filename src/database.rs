//! Read-only scene database: 3D points, the views they were reconstructed
//! from with per-observation descriptors, and surveyed marker corners.

use std::collections::HashMap;
use std::path::Path;

use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;
use crate::io::{object_from_json, object_to_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePoint {
    pub id: u32,
    pub position: na::Vector3<f64>,
}

/// Observation of a scene point in a database view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewFeature {
    pub point_id: u32,
    pub x: f32,
    pub y: f32,
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseView {
    pub id: u32,
    pub features: Vec<ViewFeature>,
    /// Marker corner ids seen from this view.
    #[serde(default)]
    pub markers: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatabaseFile {
    points: Vec<ScenePoint>,
    views: Vec<DatabaseView>,
    #[serde(default)]
    markers: Vec<ScenePoint>,
}

#[derive(Debug, Clone, Default)]
pub struct SceneDatabase {
    points: HashMap<u32, na::Vector3<f64>>,
    markers: HashMap<u32, na::Vector3<f64>>,
    views: Vec<DatabaseView>,
    descriptor_len: usize,
}

impl SceneDatabase {
    /// Builds a database and checks that every view feature refers to a
    /// known point and that all descriptors share one length.
    pub fn new(
        points: Vec<ScenePoint>,
        views: Vec<DatabaseView>,
        markers: Vec<ScenePoint>,
    ) -> Result<SceneDatabase, ConfigurationError> {
        if points.is_empty() && markers.is_empty() {
            return Err(ConfigurationError::InvalidDatabase(
                "no scene points and no markers".to_string(),
            ));
        }
        let mut point_map = HashMap::with_capacity(points.len());
        for p in points {
            if point_map.insert(p.id, p.position).is_some() {
                return Err(ConfigurationError::InvalidDatabase(format!(
                    "duplicate point id {}",
                    p.id
                )));
            }
        }
        let marker_map: HashMap<_, _> = markers.into_iter().map(|m| (m.id, m.position)).collect();

        let mut descriptor_len = 0;
        for view in &views {
            for f in &view.features {
                if !point_map.contains_key(&f.point_id) {
                    return Err(ConfigurationError::InvalidDatabase(format!(
                        "view {} references unknown point {}",
                        view.id, f.point_id
                    )));
                }
                if descriptor_len == 0 {
                    descriptor_len = f.descriptor.len();
                }
                if f.descriptor.is_empty() || f.descriptor.len() != descriptor_len {
                    return Err(ConfigurationError::InvalidDatabase(format!(
                        "view {} has a descriptor of length {}, expected {}",
                        view.id,
                        f.descriptor.len(),
                        descriptor_len
                    )));
                }
            }
        }
        log::debug!(
            "scene database: {} points, {} views, {} marker corners",
            point_map.len(),
            views.len(),
            marker_map.len()
        );
        Ok(SceneDatabase {
            points: point_map,
            markers: marker_map,
            views,
            descriptor_len,
        })
    }

    pub fn load(path: &Path) -> Result<SceneDatabase, ConfigurationError> {
        if !path.exists() {
            return Err(ConfigurationError::NotFound {
                what: "scene database",
                path: path.to_path_buf(),
            });
        }
        let file: DatabaseFile = object_from_json(path)?;
        SceneDatabase::new(file.points, file.views, file.markers)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigurationError> {
        let mut points: Vec<_> = self
            .points
            .iter()
            .map(|(&id, &position)| ScenePoint { id, position })
            .collect();
        points.sort_by_key(|p| p.id);
        let mut markers: Vec<_> = self
            .markers
            .iter()
            .map(|(&id, &position)| ScenePoint { id, position })
            .collect();
        markers.sort_by_key(|p| p.id);
        let file = DatabaseFile {
            points,
            views: self.views.clone(),
            markers,
        };
        object_to_json(path, &file)
    }

    pub fn point(&self, id: u32) -> Option<&na::Vector3<f64>> {
        self.points.get(&id)
    }

    pub fn marker(&self, id: u32) -> Option<&na::Vector3<f64>> {
        self.markers.get(&id)
    }

    pub fn views(&self) -> &[DatabaseView] {
        &self.views
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn has_markers(&self) -> bool {
        !self.markers.is_empty()
    }

    pub fn descriptor_len(&self) -> usize {
        self.descriptor_len
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &[f32]> {
        self.views
            .iter()
            .flat_map(|v| v.features.iter().map(|f| f.descriptor.as_slice()))
    }
}
