//! Shared read-only data the pipeline stages resolve meshes against.
//!
//! The context is built once, wrapped in an `Rc`, and handed to every
//! component that needs it; nothing in this crate mutates a context after
//! it is shared. Stages hold an optional handle and treat a missing
//! context or a missing mesh as "data not loaded yet", not as an error.

use std::collections::BTreeMap;

/// A surface mesh reduced to the vertex cloud the selection stages need.
#[derive(Clone, Debug, Default)]
pub struct SurfaceMesh {
    points: Vec<[f64; 3]>,
}

impl SurfaceMesh {
    #[must_use]
    pub fn new(points: Vec<[f64; 3]>) -> Self {
        Self { points }
    }

    #[inline]
    #[must_use]
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Named meshes available to a pipeline's stages.
#[derive(Clone, Debug, Default)]
pub struct StageContext {
    meshes: BTreeMap<String, SurfaceMesh>,
}

impl StageContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `mesh` under `key`, replacing any previous entry.
    pub fn insert_mesh(&mut self, key: impl Into<String>, mesh: SurfaceMesh) {
        self.meshes.insert(key.into(), mesh);
    }

    #[must_use]
    pub fn mesh(&self, key: &str) -> Option<&SurfaceMesh> {
        self.meshes.get(key)
    }

    #[must_use]
    pub fn mesh_keys(&self) -> Vec<&str> {
        self.meshes.keys().map(String::as_str).collect()
    }
}
