//! Pipeline stages: the parameterized transform steps an ROI pipeline folds
//! over.
//!
//! A stage is a cheap-clone handle held in an `IndexedList`. Kinds are a
//! closed tagged variant; every settable field has a typed setter that
//! checks the kind, skips no-op writes, and emits the item signal pair with
//! the field's wire spelling.
//!
//! Processing never fails: a stage that is not yet fully configured, or
//! whose context lacks the data it needs, logs a warning and passes its
//! input through unchanged so interactive editing stays non-disruptive.
//! A structurally mis-assembled pipeline (a grow stage with no upstream
//! selection, a source stage that is not first) is a programmer error and
//! panics.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use nnav_model::{DictItem, ListItem, ListItemSignals};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::context::StageContext;
use crate::error::{Result, RoiError};
use crate::roi::{Roi, SurfaceParts};

// ─── Distance metric ─────────────────────────────────────────────────────────

/// How a grow stage measures distance from its seed to mesh vertices.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// Declared for file compatibility; processing degrades to a logged
    /// no-op until a mesh-walking implementation lands.
    Geodesic,
}

impl DistanceMetric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Euclidean => "euclidean",
            Self::Geodesic => "geodesic",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Stage entity ────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) enum StageParams {
    Passthrough,
    SelectSurfaceSource {
        mesh_key: Option<String>,
    },
    GrowFromSeedPoint {
        seed_point: Option<[f64; 3]>,
        radius: Option<f64>,
        metric: DistanceMetric,
    },
    GrowFromSeedLine {
        seed_line: Vec<[f64; 3]>,
        radius: Option<f64>,
        metric: DistanceMetric,
    },
}

struct StageState {
    label: Option<String>,
    context: Option<Rc<StageContext>>,
    params: StageParams,
}

struct StageShell {
    signals: ListItemSignals<PipelineStage>,
    state: RefCell<StageState>,
}

/// One named, parameterized transform step in an ROI pipeline.
pub struct PipelineStage {
    shell: Rc<StageShell>,
}

impl Clone for PipelineStage {
    fn clone(&self) -> Self {
        Self {
            shell: Rc::clone(&self.shell),
        }
    }
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("label", &self.label())
            .finish()
    }
}

impl ListItem for PipelineStage {
    fn signals(&self) -> &ListItemSignals<Self> {
        &self.shell.signals
    }

    fn same_item(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shell, &other.shell)
    }
}

impl PipelineStage {
    pub(crate) fn from_parts(label: Option<String>, params: StageParams) -> Self {
        Self {
            shell: Rc::new(StageShell {
                signals: ListItemSignals::new(),
                state: RefCell::new(StageState {
                    label,
                    context: None,
                    params,
                }),
            }),
        }
    }

    /// A stage that forwards its input untouched.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::from_parts(None, StageParams::Passthrough)
    }

    /// A stage that seeds the chain with a fresh selection on a named mesh.
    #[must_use]
    pub fn select_surface_source() -> Self {
        Self::from_parts(None, StageParams::SelectSurfaceSource { mesh_key: None })
    }

    /// A stage that adds all vertices within a radius of a seed point.
    #[must_use]
    pub fn grow_from_seed_point() -> Self {
        Self::from_parts(
            None,
            StageParams::GrowFromSeedPoint {
                seed_point: None,
                radius: None,
                metric: DistanceMetric::default(),
            },
        )
    }

    /// A stage that adds all vertices within a radius of a seed polyline.
    #[must_use]
    pub fn grow_from_seed_line() -> Self {
        Self::from_parts(
            None,
            StageParams::GrowFromSeedLine {
                seed_line: Vec::new(),
                radius: None,
                metric: DistanceMetric::default(),
            },
        )
    }

    /// Stable wire tag for this stage kind.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self.shell.state.borrow().params {
            StageParams::Passthrough => "Passthrough",
            StageParams::SelectSurfaceSource { .. } => "SelectSurfaceMesh",
            StageParams::GrowFromSeedPoint { .. } => "AddFromSeedPoint",
            StageParams::GrowFromSeedLine { .. } => "AddFromSeedLines",
        }
    }

    /// Display label, falling back to the wire tag when unset.
    #[must_use]
    pub fn label(&self) -> String {
        self.shell
            .state
            .borrow()
            .label
            .clone()
            .unwrap_or_else(|| self.tag().to_string())
    }

    #[must_use]
    pub fn context(&self) -> Option<Rc<StageContext>> {
        self.shell.state.borrow().context.clone()
    }

    fn attr_err(&self, attribute: &'static str) -> RoiError {
        RoiError::AttributeNotOnStage {
            stage: self.label(),
            attribute,
        }
    }

    // ── Getters per kind ──

    pub fn mesh_key(&self) -> Result<Option<String>> {
        match &self.shell.state.borrow().params {
            StageParams::SelectSurfaceSource { mesh_key } => Ok(mesh_key.clone()),
            _ => Err(self.attr_err("meshKey")),
        }
    }

    pub fn seed_point(&self) -> Result<Option<[f64; 3]>> {
        match &self.shell.state.borrow().params {
            StageParams::GrowFromSeedPoint { seed_point, .. } => Ok(*seed_point),
            _ => Err(self.attr_err("seedPoint")),
        }
    }

    pub fn seed_line(&self) -> Result<Vec<[f64; 3]>> {
        match &self.shell.state.borrow().params {
            StageParams::GrowFromSeedLine { seed_line, .. } => Ok(seed_line.clone()),
            _ => Err(self.attr_err("seedLine")),
        }
    }

    pub fn radius(&self) -> Result<Option<f64>> {
        match &self.shell.state.borrow().params {
            StageParams::GrowFromSeedPoint { radius, .. }
            | StageParams::GrowFromSeedLine { radius, .. } => Ok(*radius),
            _ => Err(self.attr_err("radius")),
        }
    }

    pub fn metric(&self) -> Result<DistanceMetric> {
        match &self.shell.state.borrow().params {
            StageParams::GrowFromSeedPoint { metric, .. }
            | StageParams::GrowFromSeedLine { metric, .. } => Ok(*metric),
            _ => Err(self.attr_err("distanceMetric")),
        }
    }

    // ── Setters ──

    pub fn set_label(&self, label: Option<String>) {
        if self.shell.state.borrow().label == label {
            return;
        }
        info!(label = ?label, "setting stage label");
        let this = self.clone();
        self.shell.signals.change_around(&this, &["label"], || {
            self.shell.state.borrow_mut().label = label;
        });
    }

    /// Binds the mesh/data context. Identity comparison: rebinding the same
    /// context is a no-op.
    pub fn set_context(&self, context: Option<Rc<StageContext>>) {
        let same = {
            let state = self.shell.state.borrow();
            match (&state.context, &context) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            }
        };
        if same {
            return;
        }
        let this = self.clone();
        self.shell.signals.change_around(&this, &["context"], || {
            self.shell.state.borrow_mut().context = context;
        });
    }

    pub fn set_mesh_key(&self, mesh_key: Option<String>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            let StageParams::SelectSurfaceSource { mesh_key: current } = &state.params else {
                return Err(self.attr_err("meshKey"));
            };
            if *current == mesh_key {
                return Ok(());
            }
        }
        info!(mesh_key = ?mesh_key, "setting stage mesh key");
        let this = self.clone();
        self.shell.signals.change_around(&this, &["meshKey"], || {
            if let StageParams::SelectSurfaceSource { mesh_key: current } =
                &mut self.shell.state.borrow_mut().params
            {
                *current = mesh_key;
            }
        });
        Ok(())
    }

    pub fn set_seed_point(&self, seed_point: Option<[f64; 3]>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            let StageParams::GrowFromSeedPoint {
                seed_point: current,
                ..
            } = &state.params
            else {
                return Err(self.attr_err("seedPoint"));
            };
            if *current == seed_point {
                return Ok(());
            }
        }
        info!(seed_point = ?seed_point, "setting stage seed point");
        let this = self.clone();
        self.shell.signals.change_around(&this, &["seedPoint"], || {
            if let StageParams::GrowFromSeedPoint {
                seed_point: current,
                ..
            } = &mut self.shell.state.borrow_mut().params
            {
                *current = seed_point;
            }
        });
        Ok(())
    }

    pub fn set_seed_line(&self, seed_line: Vec<[f64; 3]>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            let StageParams::GrowFromSeedLine {
                seed_line: current, ..
            } = &state.params
            else {
                return Err(self.attr_err("seedLine"));
            };
            if *current == seed_line {
                return Ok(());
            }
        }
        info!(points = seed_line.len(), "setting stage seed line");
        let this = self.clone();
        self.shell.signals.change_around(&this, &["seedLine"], || {
            if let StageParams::GrowFromSeedLine {
                seed_line: current, ..
            } = &mut self.shell.state.borrow_mut().params
            {
                *current = seed_line;
            }
        });
        Ok(())
    }

    pub fn set_radius(&self, radius: Option<f64>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            match &state.params {
                StageParams::GrowFromSeedPoint {
                    radius: current, ..
                }
                | StageParams::GrowFromSeedLine {
                    radius: current, ..
                } => {
                    if *current == radius {
                        return Ok(());
                    }
                }
                _ => return Err(self.attr_err("radius")),
            }
        }
        info!(radius = ?radius, "setting stage radius");
        let this = self.clone();
        self.shell.signals.change_around(&this, &["radius"], || {
            match &mut self.shell.state.borrow_mut().params {
                StageParams::GrowFromSeedPoint {
                    radius: current, ..
                }
                | StageParams::GrowFromSeedLine {
                    radius: current, ..
                } => *current = radius,
                _ => {}
            }
        });
        Ok(())
    }

    pub fn set_metric(&self, metric: DistanceMetric) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            match &state.params {
                StageParams::GrowFromSeedPoint {
                    metric: current, ..
                }
                | StageParams::GrowFromSeedLine {
                    metric: current, ..
                } => {
                    if *current == metric {
                        return Ok(());
                    }
                }
                _ => return Err(self.attr_err("distanceMetric")),
            }
        }
        info!(metric = %metric, "setting stage distance metric");
        let this = self.clone();
        self.shell
            .signals
            .change_around(&this, &["distanceMetric"], || {
                match &mut self.shell.state.borrow_mut().params {
                    StageParams::GrowFromSeedPoint {
                        metric: current, ..
                    }
                    | StageParams::GrowFromSeedLine {
                        metric: current, ..
                    } => *current = metric,
                    _ => {}
                }
            });
        Ok(())
    }

    // ── Processing ──

    /// Runs this stage over `upstream`, producing the next link of the fold.
    ///
    /// `identity` keys any selection this stage creates from scratch.
    pub fn process(&self, identity: &str, upstream: Option<Roi>) -> Option<Roi> {
        debug!(stage = %self.label(), "starting stage processing");
        let output = self.run(identity, upstream);
        debug!(stage = %self.label(), "finished stage processing");
        output
    }

    fn run(&self, identity: &str, upstream: Option<Roi>) -> Option<Roi> {
        let (params, context) = {
            let state = self.shell.state.borrow();
            (state.params.clone(), state.context.clone())
        };
        match params {
            StageParams::Passthrough => upstream,
            StageParams::SelectSurfaceSource { mesh_key } => {
                assert!(
                    upstream.is_none(),
                    "a surface source must be the first stage of its pipeline",
                );
                Some(Roi::from_surface_parts(
                    SurfaceParts {
                        key: identity.to_string(),
                        visible: true,
                        mesh_key,
                        vertex_indices: None,
                        seed_coord: None,
                    },
                    None,
                ))
            }
            StageParams::GrowFromSeedPoint {
                seed_point,
                radius,
                metric,
            } => {
                debug!(seed = ?seed_point, radius, %metric, "growing selection from seed point");
                let Some(seed) = seed_point else {
                    warn!("no seed point configured, leaving input unchanged");
                    return upstream;
                };
                let Some(radius) = radius else {
                    warn!("no radius configured, leaving input unchanged");
                    return upstream;
                };
                grow(context, upstream, &Seed::Point(seed), radius, metric)
            }
            StageParams::GrowFromSeedLine {
                seed_line,
                radius,
                metric,
            } => {
                debug!(points = seed_line.len(), radius, %metric, "growing selection from seed line");
                if seed_line.len() < 2 {
                    warn!("seed line needs at least two points, leaving input unchanged");
                    return upstream;
                }
                let Some(radius) = radius else {
                    warn!("no radius configured, leaving input unchanged");
                    return upstream;
                };
                grow(context, upstream, &Seed::Line(seed_line), radius, metric)
            }
        }
    }
}

// ─── Grow geometry ───────────────────────────────────────────────────────────

enum Seed {
    Point([f64; 3]),
    Line(Vec<[f64; 3]>),
}

impl Seed {
    fn distance_to(&self, point: &[f64; 3]) -> f64 {
        match self {
            Self::Point(seed) => euclidean(point, seed),
            Self::Line(line) => line
                .windows(2)
                .map(|segment| segment_distance(point, &segment[0], &segment[1]))
                .fold(f64::INFINITY, f64::min),
        }
    }
}

fn grow(
    context: Option<Rc<StageContext>>,
    upstream: Option<Roi>,
    seed: &Seed,
    radius: f64,
    metric: DistanceMetric,
) -> Option<Roi> {
    let Some(input) = upstream else {
        panic!("a grow stage needs an upstream surface selection");
    };
    let Some(mut parts) = input.surface_parts() else {
        panic!("a grow stage needs a surface-mesh input, not a pipeline result");
    };
    let Some(mesh_key) = parts.mesh_key.clone() else {
        warn!("input selection names no mesh, leaving input unchanged");
        return Some(input);
    };
    let Some(context) = context else {
        warn!("no context bound, leaving input unchanged");
        return Some(input);
    };
    let Some(mesh) = context.mesh(&mesh_key) else {
        warn!(mesh = %mesh_key, "mesh not present in context, leaving input unchanged");
        return Some(input);
    };
    if metric == DistanceMetric::Geodesic {
        warn!("geodesic distance not implemented yet, leaving input unchanged");
        return Some(input);
    }

    let mut selected: BTreeSet<u32> = mesh
        .points()
        .iter()
        .enumerate()
        .filter(|(_, point)| seed.distance_to(point) <= radius)
        .map(|(index, _)| index as u32)
        .collect();
    if let Some(upstream_indices) = parts.vertex_indices.take() {
        selected.extend(upstream_indices);
    }
    parts.vertex_indices = if selected.is_empty() {
        None
    } else {
        Some(selected.into_iter().collect())
    };
    if let Seed::Point(seed_point) = seed {
        if parts.seed_coord.is_none() {
            parts.seed_coord = Some(*seed_point);
        }
    }
    Some(Roi::from_surface_parts(parts, Some(context)))
}

fn euclidean(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Distance from `point` to the segment `a..b`, falling back to the
/// endpoint distance when the segment is degenerate.
fn segment_distance(point: &[f64; 3], a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let ap = [point[0] - a[0], point[1] - a[1], point[2] - a[2]];
    let len_sq = ab[0] * ab[0] + ab[1] * ab[1] + ab[2] * ab[2];
    if len_sq == 0.0 {
        return euclidean(point, a);
    }
    let t = ((ap[0] * ab[0] + ap[1] * ab[1] + ap[2] * ab[2]) / len_sq).clamp(0.0, 1.0);
    let closest = [a[0] + t * ab[0], a[1] + t * ab[1], a[2] + t * ab[2]];
    euclidean(point, &closest)
}

// ─── Serialization ───────────────────────────────────────────────────────────

impl PipelineStage {
    /// Dict form: `"type"` plus every field that differs from its default.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        let state = self.shell.state.borrow();
        let mut d = Map::new();
        if let Some(label) = &state.label {
            d.insert("label".to_string(), json!(label));
        }
        match &state.params {
            StageParams::Passthrough => {}
            StageParams::SelectSurfaceSource { mesh_key } => {
                if let Some(mesh_key) = mesh_key {
                    d.insert("meshKey".to_string(), json!(mesh_key));
                }
            }
            StageParams::GrowFromSeedPoint {
                seed_point,
                radius,
                metric,
            } => {
                if let Some(seed_point) = seed_point {
                    d.insert("seedPoint".to_string(), json!(seed_point));
                }
                if let Some(radius) = radius {
                    d.insert("radius".to_string(), json!(radius));
                }
                if *metric != DistanceMetric::default() {
                    d.insert("distanceMetric".to_string(), json!(metric));
                }
            }
            StageParams::GrowFromSeedLine {
                seed_line,
                radius,
                metric,
            } => {
                if !seed_line.is_empty() {
                    d.insert("seedLine".to_string(), json!(seed_line));
                }
                if let Some(radius) = radius {
                    d.insert("radius".to_string(), json!(radius));
                }
                if *metric != DistanceMetric::default() {
                    d.insert("distanceMetric".to_string(), json!(metric));
                }
            }
        }
        d.insert("type".to_string(), json!(self.tag()));
        d
    }
}

impl DictItem for PipelineStage {
    fn to_dict(&self) -> Map<String, Value> {
        PipelineStage::to_dict(self)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PassthroughSnapshot {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SelectSnapshot {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    mesh_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SeedPointSnapshot {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    seed_point: Option<[f64; 3]>,
    #[serde(default)]
    radius: Option<f64>,
    #[serde(default)]
    distance_metric: DistanceMetric,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SeedLineSnapshot {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    seed_line: Vec<[f64; 3]>,
    #[serde(default)]
    radius: Option<f64>,
    #[serde(default)]
    distance_metric: DistanceMetric,
}

/// Dict constructors the registry maps tags onto. Each receives the dict
/// with the `"type"` field already removed.
pub(crate) fn passthrough_from_dict(dict: &Map<String, Value>) -> Result<PipelineStage> {
    let snap: PassthroughSnapshot = serde_json::from_value(Value::Object(dict.clone()))?;
    Ok(PipelineStage::from_parts(snap.label, StageParams::Passthrough))
}

pub(crate) fn select_from_dict(dict: &Map<String, Value>) -> Result<PipelineStage> {
    let snap: SelectSnapshot = serde_json::from_value(Value::Object(dict.clone()))?;
    Ok(PipelineStage::from_parts(
        snap.label,
        StageParams::SelectSurfaceSource {
            mesh_key: snap.mesh_key,
        },
    ))
}

pub(crate) fn seed_point_from_dict(dict: &Map<String, Value>) -> Result<PipelineStage> {
    let snap: SeedPointSnapshot = serde_json::from_value(Value::Object(dict.clone()))?;
    Ok(PipelineStage::from_parts(
        snap.label,
        StageParams::GrowFromSeedPoint {
            seed_point: snap.seed_point,
            radius: snap.radius,
            metric: snap.distance_metric,
        },
    ))
}

pub(crate) fn seed_line_from_dict(dict: &Map<String, Value>) -> Result<PipelineStage> {
    let snap: SeedLineSnapshot = serde_json::from_value(Value::Object(dict.clone()))?;
    Ok(PipelineStage::from_parts(
        snap.label,
        StageParams::GrowFromSeedLine {
            seed_line: snap.seed_line,
            radius: snap.radius,
            metric: snap.distance_metric,
        },
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
