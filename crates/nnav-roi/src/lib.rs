#![forbid(unsafe_code)]

//! Region-of-interest entities: direct surface selections and staged
//! selection pipelines over shared meshes.
//!
//! An ROI names a region on a surface mesh, either directly (mesh key plus
//! selected vertex indices) or as a pipeline of parameterized stages folded
//! into a selection on demand. Both kinds are signal-bearing collection
//! items, so a [`RoiCollection`] re-emits their changes as aggregate
//! events, and both round-trip through a sorted-key dict form byte for
//! byte.
//!
//! # Architecture
//!
//! - [`roi`]: the [`Roi`] entity in both kinds, the three-state output
//!   memo, and the [`RoiCollection`] that owns the context binding.
//! - [`stage`]: [`PipelineStage`] kinds with typed, kind-checked setters
//!   and the per-stage fold step.
//! - [`registry`]: [`StageRegistry`], mapping stage wire tags to
//!   constructors; passed by reference wherever dicts are rebuilt.
//! - [`context`]: [`StageContext`], the read-only mesh store stages
//!   resolve keys against.
//! - [`error`]: the crate's error taxonomy. Unconfigured stages are not
//!   errors; processing degrades to a logged no-op.
//!
//! # Invariants
//!
//! 1. A pipeline's memo distinguishes never-computed from computed-empty;
//!    any stage edit, and any edit to an inherited attribute, empties it
//!    before default-priority listeners observe the change.
//! 2. Previews never memoize and never emit change notifications.
//! 3. Colors, context bindings and memos are runtime-only: the dict form
//!    never carries them.
//! 4. Context flows downward only, from collection to ROI to stage; no
//!    entity holds a reference to its container.

pub mod context;
pub mod error;
pub mod registry;
pub mod roi;
pub mod stage;

pub use context::{StageContext, SurfaceMesh};
pub use error::{Result, RoiError};
pub use registry::{StageCtor, StageRegistry};
pub use roi::{Roi, RoiCollection};
pub use stage::{DistanceMetric, PipelineStage};
