//! ROI entities and the keyed collection that owns them.
//!
//! An ROI is either a direct surface selection (a named mesh plus selected
//! vertex indices) or a pipeline: an ordered stage list folded into a
//! surface selection on demand. Pipelines memoize their output in three
//! states so "computed, and the answer was nothing" is distinguishable
//! from "never computed"; any stage edit or an edit to an inherited
//! attribute throws the memo away before ordinary listeners observe the
//! change.
//!
//! Colors, the bound context and the memo are runtime-only: the dict form
//! carries none of them, so a saved document round-trips byte for byte
//! regardless of display state.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use nnav_model::{
    AttrColumn, AttrNames, DictItem, IndexedList, ItemSignals, KeyedCollection, KeyedItem,
    KeyedSignals, attr_names,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::context::StageContext;
use crate::error::{Result, RoiError};
use crate::registry::StageRegistry;
use crate::stage::PipelineStage;

// ─── Entity state ────────────────────────────────────────────────────────────

/// Memo for a pipeline's folded output.
#[derive(Clone, Debug, Default)]
enum OutputCache {
    /// Never computed, or invalidated since.
    #[default]
    Empty,
    Computed(Roi),
    /// Computed, and the fold produced no selection.
    ComputedNull,
}

#[derive(Clone, Debug)]
enum RoiDetail {
    Surface {
        mesh_key: Option<String>,
        vertex_indices: Option<Vec<u32>>,
        seed_coord: Option<[f64; 3]>,
    },
    Pipeline {
        stages: IndexedList<PipelineStage>,
        cache: OutputCache,
    },
}

struct RoiState {
    key: String,
    color: Option<[f32; 4]>,
    auto_color: Option<[f32; 3]>,
    visible: bool,
    context: Option<Rc<StageContext>>,
    detail: RoiDetail,
}

struct RoiShell {
    signals: ItemSignals<String>,
    state: RefCell<RoiState>,
}

/// Field bundle a grow stage reads from its input selection and writes
/// into its output.
pub(crate) struct SurfaceParts {
    pub key: String,
    pub visible: bool,
    pub mesh_key: Option<String>,
    pub vertex_indices: Option<Vec<u32>>,
    pub seed_coord: Option<[f64; 3]>,
}

/// A region of interest: a cheap-clone handle onto a shared entity.
pub struct Roi {
    shell: Rc<RoiShell>,
}

impl Clone for Roi {
    fn clone(&self) -> Self {
        Self {
            shell: Rc::clone(&self.shell),
        }
    }
}

impl fmt::Debug for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roi")
            .field("key", &self.key())
            .field("kind", &self.tag())
            .finish()
    }
}

impl KeyedItem for Roi {
    type Key = String;

    fn key(&self) -> String {
        Roi::key(self)
    }

    fn set_key(&self, key: String) {
        let current = self.shell.state.borrow().key.clone();
        if current == key {
            return;
        }
        self.shell.signals.rekey_around(&current, &key, || {
            self.shell.state.borrow_mut().key = key.clone();
        });
    }

    fn signals(&self) -> &ItemSignals<String> {
        &self.shell.signals
    }

    fn same_item(&self, other: &Self) -> bool {
        self.same_roi(other)
    }
}

// ─── Construction ────────────────────────────────────────────────────────────

impl Roi {
    fn from_state(state: RoiState) -> Self {
        let is_pipeline = matches!(state.detail, RoiDetail::Pipeline { .. });
        let roi = Self {
            shell: Rc::new(RoiShell {
                signals: ItemSignals::new(),
                state: RefCell::new(state),
            }),
        };
        if is_pipeline {
            Self::wire_pipeline(&roi.shell);
        }
        roi
    }

    /// A direct surface selection with nothing selected yet.
    #[must_use]
    pub fn surface(key: impl Into<String>) -> Self {
        Self::from_state(RoiState {
            key: key.into(),
            color: None,
            auto_color: None,
            visible: true,
            context: None,
            detail: RoiDetail::Surface {
                mesh_key: None,
                vertex_indices: None,
                seed_coord: None,
            },
        })
    }

    /// A pipeline with an empty stage list.
    #[must_use]
    pub fn pipeline(key: impl Into<String>) -> Self {
        Self::from_state(RoiState {
            key: key.into(),
            color: None,
            auto_color: None,
            visible: true,
            context: None,
            detail: RoiDetail::Pipeline {
                stages: IndexedList::new(),
                cache: OutputCache::Empty,
            },
        })
    }

    /// Subscribes the owning entity to its stage list.
    ///
    /// On the stage aggregate, the memo is cleared above default priority
    /// so every other listener already sees the invalidated state; within
    /// priority zero, context propagation is connected before the change
    /// re-announcement. The entity's own `changed` signal clears the memo
    /// at priority 2 when an inherited attribute moves, since those were
    /// copied onto the output during processing.
    fn wire_pipeline(shell: &Rc<RoiShell>) {
        let stages = {
            let guard = shell.state.borrow();
            let RoiDetail::Pipeline { stages, .. } = &guard.detail else {
                return;
            };
            stages.clone()
        };
        let aggregate = stages.signals();

        let weak = Rc::downgrade(shell);
        aggregate.items_about_to_change().connect(move |_| {
            let Some(shell) = weak.upgrade() else { return };
            let key = shell.state.borrow().key.clone();
            shell
                .signals
                .about_to_change()
                .emit(&(key, attr_names(&["stages"])));
        });

        let weak = Rc::downgrade(shell);
        aggregate.items_changed().connect_with_priority(
            move |_| {
                let Some(shell) = weak.upgrade() else { return };
                Roi::clear_cache_inner(&shell);
            },
            1,
        );

        let weak = Rc::downgrade(shell);
        aggregate.items_changed().connect(
            move |(items, attrs): &(Vec<PipelineStage>, AttrNames)| {
                let Some(shell) = weak.upgrade() else { return };
                debug!(stages = items.len(), attrs = ?attrs, "stage membership listener");
                if attrs.is_some() {
                    return;
                }
                let (context, list) = {
                    let guard = shell.state.borrow();
                    match &guard.detail {
                        RoiDetail::Pipeline { stages, .. } => {
                            (guard.context.clone(), stages.clone())
                        }
                        RoiDetail::Surface { .. } => return,
                    }
                };
                for stage in items {
                    if list.position_of(stage).is_some() {
                        stage.set_context(context.clone());
                    }
                }
            },
        );

        let weak = Rc::downgrade(shell);
        aggregate.items_changed().connect(move |_| {
            let Some(shell) = weak.upgrade() else { return };
            let key = shell.state.borrow().key.clone();
            shell
                .signals
                .changed()
                .emit(&(key, attr_names(&["stages"])));
        });

        let weak = Rc::downgrade(shell);
        shell.signals.changed().connect_with_priority(
            move |(_, attrs): &(String, AttrNames)| {
                let stale = match attrs {
                    None => true,
                    Some(names) => names.iter().any(|name| name == "color" || name == "autoColor"),
                };
                if !stale {
                    return;
                }
                let Some(shell) = weak.upgrade() else { return };
                Roi::clear_cache_inner(&shell);
            },
            2,
        );
    }

    // ── Identity ──

    /// The key this ROI is filed under.
    #[must_use]
    pub fn key(&self) -> String {
        self.shell.state.borrow().key.clone()
    }

    /// Whether `other` aliases the same underlying entity.
    #[must_use]
    pub fn same_roi(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shell, &other.shell)
    }

    /// Stable wire tag for this ROI kind.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self.shell.state.borrow().detail {
            RoiDetail::Surface { .. } => "SurfaceMeshROI",
            RoiDetail::Pipeline { .. } => "PipelineROI",
        }
    }

    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        matches!(self.shell.state.borrow().detail, RoiDetail::Pipeline { .. })
    }

    // ── Shared attributes ──

    #[must_use]
    pub fn visible(&self) -> bool {
        self.shell.state.borrow().visible
    }

    pub fn set_visible(&self, visible: bool) {
        if self.shell.state.borrow().visible == visible {
            return;
        }
        let key = self.key();
        self.shell.signals.change_around(&key, &["isVisible"], || {
            self.shell.state.borrow_mut().visible = visible;
        });
    }

    #[must_use]
    pub fn color(&self) -> Option<[f32; 4]> {
        self.shell.state.borrow().color
    }

    pub fn set_color(&self, color: Option<[f32; 4]>) -> Result<()> {
        if let Some(components) = &color {
            validate_components(components)?;
        }
        if self.shell.state.borrow().color == color {
            return Ok(());
        }
        info!(color = ?color, "setting roi color");
        let key = self.key();
        self.shell.signals.change_around(&key, &["color"], || {
            self.shell.state.borrow_mut().color = color;
        });
        Ok(())
    }

    #[must_use]
    pub fn auto_color(&self) -> Option<[f32; 3]> {
        self.shell.state.borrow().auto_color
    }

    pub fn set_auto_color(&self, auto_color: Option<[f32; 3]>) -> Result<()> {
        if let Some(components) = &auto_color {
            validate_components(components)?;
        }
        if self.shell.state.borrow().auto_color == auto_color {
            return Ok(());
        }
        info!(auto_color = ?auto_color, "setting roi auto color");
        let key = self.key();
        self.shell.signals.change_around(&key, &["autoColor"], || {
            self.shell.state.borrow_mut().auto_color = auto_color;
        });
        Ok(())
    }

    #[must_use]
    pub fn context(&self) -> Option<Rc<StageContext>> {
        self.shell.state.borrow().context.clone()
    }

    /// Binds the mesh/data context, handing it on to every stage when this
    /// ROI is a pipeline. Identity comparison: rebinding the same context
    /// is a no-op.
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
        let ev = (self.key(), attr_names(&["context"]));
        self.shell.signals.about_to_change().emit(&ev);
        let stages = {
            let mut state = self.shell.state.borrow_mut();
            state.context = context.clone();
            match &state.detail {
                RoiDetail::Pipeline { stages, .. } => Some(stages.clone()),
                RoiDetail::Surface { .. } => None,
            }
        };
        if let Some(stages) = stages {
            for stage in stages.items() {
                stage.set_context(context.clone());
            }
        }
        self.shell.signals.changed().emit(&ev);
    }

    // ── Surface attributes ──

    pub fn mesh_key(&self) -> Result<Option<String>> {
        match &self.shell.state.borrow().detail {
            RoiDetail::Surface { mesh_key, .. } => Ok(mesh_key.clone()),
            RoiDetail::Pipeline { .. } => Err(RoiError::NotASurface(self.key())),
        }
    }

    pub fn set_mesh_key(&self, mesh_key: Option<String>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            let RoiDetail::Surface {
                mesh_key: current, ..
            } = &state.detail
            else {
                return Err(RoiError::NotASurface(state.key.clone()));
            };
            if *current == mesh_key {
                return Ok(());
            }
        }
        info!(mesh_key = ?mesh_key, "setting roi mesh key");
        let key = self.key();
        self.shell.signals.change_around(&key, &["meshKey"], || {
            if let RoiDetail::Surface {
                mesh_key: current, ..
            } = &mut self.shell.state.borrow_mut().detail
            {
                *current = mesh_key;
            }
        });
        Ok(())
    }

    pub fn vertex_indices(&self) -> Result<Option<Vec<u32>>> {
        match &self.shell.state.borrow().detail {
            RoiDetail::Surface { vertex_indices, .. } => Ok(vertex_indices.clone()),
            RoiDetail::Pipeline { .. } => Err(RoiError::NotASurface(self.key())),
        }
    }

    /// Sets the selected vertex set. An empty selection is normalized to
    /// `None` so "nothing selected" has one representation.
    pub fn set_vertex_indices(&self, indices: Option<Vec<u32>>) -> Result<()> {
        let indices = indices.filter(|list| !list.is_empty());
        {
            let state = self.shell.state.borrow();
            let RoiDetail::Surface {
                vertex_indices: current,
                ..
            } = &state.detail
            else {
                return Err(RoiError::NotASurface(state.key.clone()));
            };
            if *current == indices {
                return Ok(());
            }
        }
        info!(
            count = indices.as_ref().map_or(0, Vec::len),
            "setting roi vertex indices"
        );
        let key = self.key();
        self.shell
            .signals
            .change_around(&key, &["meshVertexIndices"], || {
                if let RoiDetail::Surface {
                    vertex_indices: current,
                    ..
                } = &mut self.shell.state.borrow_mut().detail
                {
                    *current = indices;
                }
            });
        Ok(())
    }

    pub fn seed_coord(&self) -> Result<Option<[f64; 3]>> {
        match &self.shell.state.borrow().detail {
            RoiDetail::Surface { seed_coord, .. } => Ok(*seed_coord),
            RoiDetail::Pipeline { .. } => Err(RoiError::NotASurface(self.key())),
        }
    }

    pub fn set_seed_coord(&self, seed_coord: Option<[f64; 3]>) -> Result<()> {
        {
            let state = self.shell.state.borrow();
            let RoiDetail::Surface {
                seed_coord: current,
                ..
            } = &state.detail
            else {
                return Err(RoiError::NotASurface(state.key.clone()));
            };
            if *current == seed_coord {
                return Ok(());
            }
        }
        info!(seed_coord = ?seed_coord, "setting roi seed coordinate");
        let key = self.key();
        self.shell.signals.change_around(&key, &["seedCoord"], || {
            if let RoiDetail::Surface {
                seed_coord: current,
                ..
            } = &mut self.shell.state.borrow_mut().detail
            {
                *current = seed_coord;
            }
        });
        Ok(())
    }

    pub(crate) fn surface_parts(&self) -> Option<SurfaceParts> {
        let state = self.shell.state.borrow();
        match &state.detail {
            RoiDetail::Surface {
                mesh_key,
                vertex_indices,
                seed_coord,
            } => Some(SurfaceParts {
                key: state.key.clone(),
                visible: state.visible,
                mesh_key: mesh_key.clone(),
                vertex_indices: vertex_indices.clone(),
                seed_coord: *seed_coord,
            }),
            RoiDetail::Pipeline { .. } => None,
        }
    }

    pub(crate) fn from_surface_parts(
        parts: SurfaceParts,
        context: Option<Rc<StageContext>>,
    ) -> Self {
        Self::from_state(RoiState {
            key: parts.key,
            color: None,
            auto_color: None,
            visible: parts.visible,
            context,
            detail: RoiDetail::Surface {
                mesh_key: parts.mesh_key,
                vertex_indices: parts.vertex_indices,
                seed_coord: parts.seed_coord,
            },
        })
    }

    // ── Pipeline operations ──

    /// The pipeline's stage list.
    pub fn stages(&self) -> Result<IndexedList<PipelineStage>> {
        match &self.shell.state.borrow().detail {
            RoiDetail::Pipeline { stages, .. } => Ok(stages.clone()),
            RoiDetail::Surface { .. } => Err(RoiError::NotAPipeline(self.key())),
        }
    }

    /// Folds the stage list into an output selection.
    ///
    /// With `upto` set this is a preview: the fold stops after the stage at
    /// that index (or runs the whole chain when the index is past the end)
    /// and returns the intermediate result without memoizing it or emitting
    /// any change notification. A full run brackets the fold in the
    /// `output` about/changed pair, copies `color` and `autoColor` onto the
    /// output where the output has none, and memoizes the result.
    pub fn process(&self, upto: Option<usize>) -> Result<Option<Roi>> {
        let key = self.key();
        let stages = self.stages()?;
        debug!(roi = %key, upto = ?upto, "processing pipeline");

        if upto.is_none() {
            self.shell
                .signals
                .about_to_change()
                .emit(&(key.clone(), attr_names(&["output"])));
        }

        let snapshot = stages.items();
        let mut current: Option<Roi> = None;
        if snapshot.is_empty() {
            info!(roi = %key, "pipeline has no stages, producing an empty selection");
            current = Some(Roi::surface(key.clone()));
        } else {
            for (index, stage) in snapshot.iter().enumerate() {
                debug!(index, stage = %stage.label(), "processing pipeline stage");
                current = stage.process(&index.to_string(), current);
                if upto == Some(index) {
                    return Ok(current);
                }
            }
        }
        if upto.is_some() {
            return Ok(current);
        }

        if let Some(output) = &current {
            if output.color().is_none() {
                output.set_color(self.color())?;
            }
            if output.auto_color().is_none() {
                output.set_auto_color(self.auto_color())?;
            }
        }

        {
            let mut state = self.shell.state.borrow_mut();
            if let RoiDetail::Pipeline { cache, .. } = &mut state.detail {
                *cache = match &current {
                    Some(output) => OutputCache::Computed(output.clone()),
                    None => OutputCache::ComputedNull,
                };
            }
        }

        self.shell
            .signals
            .changed()
            .emit(&(key, attr_names(&["output"])));

        Ok(current)
    }

    /// The memoized output, computing it on first read.
    pub fn output(&self) -> Result<Option<Roi>> {
        {
            let state = self.shell.state.borrow();
            match &state.detail {
                RoiDetail::Surface { .. } => {
                    return Err(RoiError::NotAPipeline(state.key.clone()));
                }
                RoiDetail::Pipeline { cache, .. } => match cache {
                    OutputCache::Computed(output) => return Ok(Some(output.clone())),
                    OutputCache::ComputedNull => return Ok(None),
                    OutputCache::Empty => {}
                },
            }
        }
        self.process(None)
    }

    /// Drops any memoized output; the next read recomputes.
    pub fn clear_cache(&self) -> Result<()> {
        if !self.is_pipeline() {
            return Err(RoiError::NotAPipeline(self.key()));
        }
        Self::clear_cache_inner(&self.shell);
        Ok(())
    }

    fn clear_cache_inner(shell: &Rc<RoiShell>) {
        let mut state = shell.state.borrow_mut();
        let state = &mut *state;
        if let RoiDetail::Pipeline { cache, .. } = &mut state.detail {
            debug!(roi = %state.key, "clearing cached pipeline output");
            *cache = OutputCache::Empty;
        }
    }

    // ── Persistence ──

    /// Rebuilds an ROI from its dict form, dispatching on `"type"`.
    pub fn from_dict(registry: &StageRegistry, dict: &Map<String, Value>) -> Result<Self> {
        let Some(tag) = dict.get("type").and_then(Value::as_str) else {
            return Err(RoiError::MissingType);
        };
        let mut body = dict.clone();
        body.remove("type");
        match tag {
            "SurfaceMeshROI" => {
                let snap: SurfaceSnapshot = serde_json::from_value(Value::Object(body))?;
                Ok(Self::from_state(RoiState {
                    key: snap.key,
                    color: None,
                    auto_color: None,
                    visible: snap.is_visible,
                    context: None,
                    detail: RoiDetail::Surface {
                        mesh_key: snap.mesh_key,
                        vertex_indices: snap.mesh_vertex_indices.filter(|list| !list.is_empty()),
                        seed_coord: snap.seed_coord,
                    },
                }))
            }
            "PipelineROI" => {
                let snap: PipelineSnapshot = serde_json::from_value(Value::Object(body))?;
                let stages = IndexedList::new();
                for stage_dict in &snap.stages {
                    stages.append(registry.build(stage_dict)?)?;
                }
                Ok(Self::from_state(RoiState {
                    key: snap.key,
                    color: None,
                    auto_color: None,
                    visible: snap.is_visible,
                    context: None,
                    detail: RoiDetail::Pipeline {
                        stages,
                        cache: OutputCache::Empty,
                    },
                }))
            }
            other => Err(RoiError::UnknownRoiType(other.to_string())),
        }
    }

    /// A detached duplicate built by round-tripping the dict form; the
    /// runtime-only attributes (colors, memo) start fresh, and the context
    /// binding is carried over.
    pub fn copy(&self, registry: &StageRegistry) -> Result<Self> {
        let copy = Self::from_dict(registry, &self.to_dict())?;
        copy.set_context(self.context());
        Ok(copy)
    }
}

fn validate_components(components: &[f32]) -> Result<()> {
    if components.iter().all(|c| (0.0..=1.0).contains(c)) {
        Ok(())
    } else {
        Err(RoiError::InvalidColor(format!("{components:?}")))
    }
}

/// Dict form: `key` and `type` always, `isVisible` only when hidden,
/// surface fields when set, and for pipelines the full `stages` array
/// even when empty. Colors, context and the memo never appear.
impl DictItem for Roi {
    fn to_dict(&self) -> Map<String, Value> {
        let state = self.shell.state.borrow();
        let mut d = Map::new();
        d.insert("key".to_string(), json!(state.key));
        if !state.visible {
            d.insert("isVisible".to_string(), json!(false));
        }
        match &state.detail {
            RoiDetail::Surface {
                mesh_key,
                vertex_indices,
                seed_coord,
            } => {
                if let Some(mesh_key) = mesh_key {
                    d.insert("meshKey".to_string(), json!(mesh_key));
                }
                if let Some(indices) = vertex_indices {
                    d.insert("meshVertexIndices".to_string(), json!(indices));
                }
                if let Some(coord) = seed_coord {
                    d.insert("seedCoord".to_string(), json!(coord));
                }
                d.insert("type".to_string(), json!("SurfaceMeshROI"));
            }
            RoiDetail::Pipeline { stages, .. } => {
                let list: Vec<Value> = stages
                    .items()
                    .iter()
                    .map(|stage| Value::Object(stage.to_dict()))
                    .collect();
                d.insert("stages".to_string(), Value::Array(list));
                d.insert("type".to_string(), json!("PipelineROI"));
            }
        }
        d
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SurfaceSnapshot {
    key: String,
    #[serde(default = "default_true")]
    is_visible: bool,
    #[serde(default)]
    mesh_key: Option<String>,
    #[serde(default)]
    mesh_vertex_indices: Option<Vec<u32>>,
    #[serde(default)]
    seed_coord: Option<[f64; 3]>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PipelineSnapshot {
    key: String,
    #[serde(default = "default_true")]
    is_visible: bool,
    stages: Vec<Map<String, Value>>,
}

// ─── Collection ──────────────────────────────────────────────────────────────

struct CollectionShell {
    items: KeyedCollection<Roi>,
    context: RefCell<Option<Rc<StageContext>>>,
}

/// The keyed collection of a document's ROIs.
///
/// Owns the shared context binding: every ROI that enters the collection
/// (and every ROI present when the binding changes) is handed the current
/// context, so stage processing resolves meshes without items ever
/// reaching back into their container.
pub struct RoiCollection {
    shell: Rc<CollectionShell>,
}

impl Clone for RoiCollection {
    fn clone(&self) -> Self {
        Self {
            shell: Rc::clone(&self.shell),
        }
    }
}

impl Default for RoiCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoiCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoiCollection")
            .field("keys", &self.keys())
            .finish()
    }
}

impl RoiCollection {
    #[must_use]
    pub fn new() -> Self {
        let shell = Rc::new(CollectionShell {
            items: KeyedCollection::new(),
            context: RefCell::new(None),
        });
        // Membership changes hand the collection's context to the listed
        // residents before any outside listener runs.
        let weak = Rc::downgrade(&shell);
        shell.items.signals().items_changed().connect(
            move |(keys, attrs): &(Vec<String>, AttrNames)| {
                let Some(shell) = weak.upgrade() else { return };
                debug!(keys = ?keys, attrs = ?attrs, "roi membership listener");
                if attrs.is_some() {
                    return;
                }
                let context = shell.context.borrow().clone();
                for key in keys {
                    if let Some(roi) = shell.items.get(key) {
                        roi.set_context(context.clone());
                    }
                }
            },
        );
        Self { shell }
    }

    /// Aggregate change signals, shared by every handle onto this
    /// collection.
    #[must_use]
    pub fn signals(&self) -> &KeyedSignals<String> {
        self.shell.items.signals()
    }

    #[must_use]
    pub fn context(&self) -> Option<Rc<StageContext>> {
        self.shell.context.borrow().clone()
    }

    /// Binds the context and fans it out to every resident ROI. Identity
    /// comparison: rebinding the same context is a no-op.
    pub fn set_context(&self, context: Option<Rc<StageContext>>) {
        let same = {
            let current = self.shell.context.borrow();
            match (&*current, &context) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            }
        };
        if same {
            return;
        }
        *self.shell.context.borrow_mut() = context.clone();
        for roi in self.shell.items.values() {
            roi.set_context(context.clone());
        }
    }

    pub fn add(&self, roi: Roi) -> Result<()> {
        self.shell.items.add(roi)?;
        Ok(())
    }

    /// Inserts or replaces under the ROI's own key.
    pub fn set_item(&self, roi: Roi) {
        self.shell.items.set_item(roi);
    }

    pub fn delete(&self, keys: &[String]) -> Result<Vec<Roi>> {
        Ok(self.shell.items.delete(keys)?)
    }

    /// Re-keys `from` to `to`, refusing collisions before any signal fires.
    pub fn rename(&self, from: &str, to: String) -> Result<()> {
        self.shell.items.rename(&from.to_string(), to)?;
        Ok(())
    }

    /// Batched attribute write across several ROIs; see
    /// [`KeyedCollection::set_attr_for_many`].
    pub fn set_attr_for_many(
        &self,
        keys: &[String],
        columns: &[&dyn AttrColumn<Roi>],
    ) -> Result<()> {
        Ok(self.shell.items.set_attr_for_many(keys, columns)?)
    }

    /// Merges `rois` in, replacing residents that share a key.
    pub fn merge(&self, rois: Vec<Roi>) {
        self.shell.items.merge(rois);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Roi> {
        self.shell.items.get(&key.to_string())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.shell.items.contains_key(&key.to_string())
    }

    #[must_use]
    pub fn position(&self, key: &str) -> Option<usize> {
        self.shell.items.position(&key.to_string())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.shell.items.keys()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Roi> {
        self.shell.items.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shell.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shell.items.is_empty()
    }

    /// Dict forms of all ROIs in collection order.
    #[must_use]
    pub fn to_list(&self) -> Vec<Map<String, Value>> {
        self.shell.items.to_list()
    }

    /// Rebuilds a collection from a saved list. Later duplicates of a key
    /// win, matching `set_item`.
    pub fn from_list(registry: &StageRegistry, list: &[Map<String, Value>]) -> Result<Self> {
        let collection = Self::new();
        for dict in list {
            collection.shell.items.set_item(Roi::from_dict(registry, dict)?);
        }
        Ok(collection)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SurfaceMesh;
    use nnav_model::{ModelError, column};

    fn ctx() -> Rc<StageContext> {
        let mut context = StageContext::new();
        context.insert_mesh(
            "gm",
            SurfaceMesh::new(vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [2.0, 0.0, 0.0],
                [3.0, 0.0, 0.0],
                [10.0, 0.0, 0.0],
            ]),
        );
        Rc::new(context)
    }

    /// Select the `gm` mesh, then grow from the origin with `radius`.
    fn selection_pipeline(context: &Rc<StageContext>, radius: f64) -> Roi {
        let roi = Roi::pipeline("motor");
        roi.set_context(Some(Rc::clone(context)));
        let select = PipelineStage::select_surface_source();
        select.set_mesh_key(Some("gm".to_string())).unwrap();
        let grow = PipelineStage::grow_from_seed_point();
        grow.set_seed_point(Some([0.0, 0.0, 0.0])).unwrap();
        grow.set_radius(Some(radius)).unwrap();
        let stages = roi.stages().unwrap();
        stages.append(select).unwrap();
        stages.append(grow).unwrap();
        roi
    }

    /// Counts `changed` emissions that name `output`.
    fn output_events(roi: &Roi) -> Rc<RefCell<usize>> {
        let count = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&count);
        roi.signals()
            .changed()
            .connect(move |(_, attrs): &(String, AttrNames)| {
                if let Some(names) = attrs {
                    if names.iter().any(|name| name == "output") {
                        *sink.borrow_mut() += 1;
                    }
                }
            });
        count
    }

    fn as_json(d: &Map<String, Value>) -> String {
        serde_json::to_string(&Value::Object(d.clone())).unwrap()
    }

    // ── Kind guards and shared attributes ──

    #[test]
    fn accessors_guard_entity_kind() {
        let pipeline = Roi::pipeline("p");
        assert!(matches!(
            pipeline.set_mesh_key(Some("gm".to_string())),
            Err(RoiError::NotASurface(key)) if key == "p"
        ));
        assert!(matches!(
            pipeline.vertex_indices(),
            Err(RoiError::NotASurface(_))
        ));

        let surface = Roi::surface("s");
        assert!(matches!(
            surface.stages(),
            Err(RoiError::NotAPipeline(key)) if key == "s"
        ));
        assert!(matches!(surface.output(), Err(RoiError::NotAPipeline(_))));
        assert!(matches!(
            surface.clear_cache(),
            Err(RoiError::NotAPipeline(_))
        ));
    }

    #[test]
    fn color_components_are_validated() {
        let roi = Roi::surface("s");
        assert!(matches!(
            roi.set_color(Some([1.5, 0.0, 0.0, 1.0])),
            Err(RoiError::InvalidColor(_))
        ));
        assert!(matches!(
            roi.set_auto_color(Some([-0.1, 0.0, 0.0])),
            Err(RoiError::InvalidColor(_))
        ));
        roi.set_color(Some([0.2, 0.4, 0.6, 1.0])).unwrap();
        assert_eq!(roi.color(), Some([0.2, 0.4, 0.6, 1.0]));
    }

    #[test]
    fn empty_vertex_selection_normalizes_to_none() {
        let roi = Roi::surface("s");
        roi.set_vertex_indices(Some(vec![3, 1])).unwrap();
        assert_eq!(roi.vertex_indices().unwrap(), Some(vec![3, 1]));
        roi.set_vertex_indices(Some(Vec::new())).unwrap();
        assert_eq!(roi.vertex_indices().unwrap(), None);
    }

    // ── Serialization ──

    #[test]
    fn fresh_surface_serializes_minimally() {
        let roi = Roi::surface("s");
        assert_eq!(as_json(&roi.to_dict()), r#"{"key":"s","type":"SurfaceMeshROI"}"#);
        roi.set_visible(false);
        assert_eq!(
            as_json(&roi.to_dict()),
            r#"{"isVisible":false,"key":"s","type":"SurfaceMeshROI"}"#
        );
    }

    #[test]
    fn pipeline_dict_always_carries_stages() {
        let roi = Roi::pipeline("p");
        assert_eq!(
            as_json(&roi.to_dict()),
            r#"{"key":"p","stages":[],"type":"PipelineROI"}"#
        );
    }

    #[test]
    fn colors_and_context_never_reach_the_dict() {
        let roi = Roi::surface("s");
        roi.set_color(Some([0.1, 0.2, 0.3, 1.0])).unwrap();
        roi.set_auto_color(Some([0.5, 0.5, 0.5])).unwrap();
        roi.set_context(Some(ctx()));
        assert_eq!(as_json(&roi.to_dict()), r#"{"key":"s","type":"SurfaceMeshROI"}"#);

        let copy = roi.copy(&StageRegistry::builtin()).unwrap();
        assert!(!copy.same_roi(&roi));
        assert_eq!(copy.color(), None);
        assert_eq!(copy.auto_color(), None);
        // The context binding does carry over.
        assert!(copy.context().is_some());
    }

    #[test]
    fn surface_round_trips_byte_equal() {
        let roi = Roi::surface("hotspot");
        roi.set_visible(false);
        roi.set_mesh_key(Some("gm".to_string())).unwrap();
        roi.set_vertex_indices(Some(vec![5, 2, 9])).unwrap();
        roi.set_seed_coord(Some([0.5, -1.0, 2.0])).unwrap();

        let registry = StageRegistry::builtin();
        let rebuilt = Roi::from_dict(&registry, &roi.to_dict()).unwrap();
        assert_eq!(as_json(&roi.to_dict()), as_json(&rebuilt.to_dict()));
        assert_eq!(rebuilt.vertex_indices().unwrap(), Some(vec![5, 2, 9]));
    }

    #[test]
    fn pipeline_round_trips_byte_equal() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let registry = StageRegistry::builtin();
        let rebuilt = Roi::from_dict(&registry, &roi.to_dict()).unwrap();
        assert_eq!(as_json(&roi.to_dict()), as_json(&rebuilt.to_dict()));

        let stages = rebuilt.stages().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages.get(0).unwrap().tag(), "SelectSurfaceMesh");
        assert_eq!(stages.get(1).unwrap().tag(), "AddFromSeedPoint");
        // Rebuilt stages start without a context until one is bound.
        assert!(stages.get(0).unwrap().context().is_none());
    }

    #[test]
    fn from_dict_rejects_malformed_input() {
        let registry = StageRegistry::builtin();
        let mut dict = Map::new();
        dict.insert("key".to_string(), json!("x"));
        assert!(matches!(
            Roi::from_dict(&registry, &dict),
            Err(RoiError::MissingType)
        ));

        dict.insert("type".to_string(), json!("VolumeROI"));
        assert!(matches!(
            Roi::from_dict(&registry, &dict),
            Err(RoiError::UnknownRoiType(tag)) if tag == "VolumeROI"
        ));

        // A pipeline dict without its stages array is malformed.
        let mut dict = Map::new();
        dict.insert("key".to_string(), json!("p"));
        dict.insert("type".to_string(), json!("PipelineROI"));
        assert!(matches!(
            Roi::from_dict(&registry, &dict),
            Err(RoiError::Deserialize(_))
        ));
    }

    // ── Processing and the memo ──

    #[test]
    fn zero_stage_pipeline_outputs_empty_selection_under_own_key() {
        let roi = Roi::pipeline("motor");
        let output = roi.output().unwrap().unwrap();
        assert_eq!(output.key(), "motor");
        assert_eq!(output.mesh_key().unwrap(), None);
        assert_eq!(output.vertex_indices().unwrap(), None);
    }

    #[test]
    fn output_memoizes_until_invalidated() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let events = output_events(&roi);

        let first = roi.output().unwrap().unwrap();
        assert_eq!(first.vertex_indices().unwrap(), Some(vec![0, 1]));
        assert_eq!(*events.borrow(), 1);

        let second = roi.output().unwrap().unwrap();
        assert!(second.same_roi(&first));
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn null_output_is_memoized_too() {
        let roi = Roi::pipeline("p");
        roi.stages()
            .unwrap()
            .append(PipelineStage::passthrough())
            .unwrap();
        let events = output_events(&roi);

        assert!(roi.output().unwrap().is_none());
        assert_eq!(*events.borrow(), 1);
        // A passthrough chain that starts from nothing stays nothing; the
        // memo answers without reprocessing.
        assert!(roi.output().unwrap().is_none());
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn stage_edit_invalidates_and_recompute_sees_superset() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let events = output_events(&roi);
        let first = roi.output().unwrap().unwrap();
        assert_eq!(first.vertex_indices().unwrap(), Some(vec![0, 1]));

        let grow = roi.stages().unwrap().get(1).unwrap();
        grow.set_radius(Some(2.5)).unwrap();

        let second = roi.output().unwrap().unwrap();
        assert!(!second.same_roi(&first));
        assert_eq!(second.vertex_indices().unwrap(), Some(vec![0, 1, 2]));
        assert_eq!(*events.borrow(), 2);
    }

    #[test]
    fn structural_stage_change_invalidates() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let first = roi.output().unwrap().unwrap();
        assert_eq!(first.vertex_indices().unwrap(), Some(vec![0, 1]));

        // Dropping the grow stage leaves just the bare selection.
        roi.stages().unwrap().delete_at(&[1]).unwrap();
        let second = roi.output().unwrap().unwrap();
        assert_eq!(second.vertex_indices().unwrap(), None);
    }

    #[test]
    fn invalidation_outruns_default_priority_listeners() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let _ = roi.output().unwrap();

        let seen: Rc<RefCell<Vec<Option<Vec<u32>>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let reader = roi.clone();
        roi.stages().unwrap().signals().items_changed().connect(
            move |(_, attrs): &(Vec<PipelineStage>, AttrNames)| {
                if attrs.is_none() {
                    return;
                }
                let output = reader.output().unwrap().unwrap();
                sink.borrow_mut().push(output.vertex_indices().unwrap());
            },
        );

        let grow = roi.stages().unwrap().get(1).unwrap();
        grow.set_radius(Some(3.5)).unwrap();

        // The default-priority reader already sees the recomputed output.
        assert_eq!(
            seen.borrow().as_slice(),
            [Some(vec![0, 1, 2, 3])].as_slice()
        );
    }

    #[test]
    fn editing_inherited_attributes_invalidates() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let events = output_events(&roi);
        let first = roi.output().unwrap().unwrap();
        assert_eq!(first.color(), None);

        roi.set_color(Some([0.9, 0.1, 0.1, 1.0])).unwrap();
        let second = roi.output().unwrap().unwrap();
        assert!(!second.same_roi(&first));
        assert_eq!(second.color(), Some([0.9, 0.1, 0.1, 1.0]));
        assert_eq!(*events.borrow(), 2);
    }

    #[test]
    fn visibility_edit_keeps_the_memo() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let events = output_events(&roi);
        let first = roi.output().unwrap().unwrap();

        roi.set_visible(false);
        let second = roi.output().unwrap().unwrap();
        assert!(second.same_roi(&first));
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn inherited_colors_copy_only_when_output_has_none() {
        let context = ctx();

        // Pipeline without colors: output keeps its own none.
        let plain = selection_pipeline(&context, 1.5);
        let output = plain.output().unwrap().unwrap();
        assert_eq!(output.color(), None);
        assert_eq!(output.auto_color(), None);

        // Pipeline with colors set before processing: output inherits both.
        let tinted = selection_pipeline(&context, 1.5);
        tinted.set_color(Some([0.0, 0.5, 1.0, 1.0])).unwrap();
        tinted.set_auto_color(Some([0.3, 0.3, 0.3])).unwrap();
        let output = tinted.output().unwrap().unwrap();
        assert_eq!(output.color(), Some([0.0, 0.5, 1.0, 1.0]));
        assert_eq!(output.auto_color(), Some([0.3, 0.3, 0.3]));
    }

    #[test]
    fn preview_returns_intermediate_without_memo_or_signals() {
        let roi = selection_pipeline(&ctx(), 1.5);
        let events = output_events(&roi);

        let intermediate = roi.process(Some(0)).unwrap().unwrap();
        assert_eq!(intermediate.key(), "0");
        assert_eq!(intermediate.mesh_key().unwrap(), Some("gm".to_string()));
        assert_eq!(intermediate.vertex_indices().unwrap(), None);
        assert_eq!(*events.borrow(), 0);

        // The memo is still empty, so a real read computes.
        let output = roi.output().unwrap().unwrap();
        assert_eq!(output.vertex_indices().unwrap(), Some(vec![0, 1]));
        assert_eq!(*events.borrow(), 1);

        // A preview past the end folds the whole chain, still silently.
        let full = roi.process(Some(10)).unwrap().unwrap();
        assert_eq!(full.vertex_indices().unwrap(), Some(vec![0, 1]));
        assert!(!full.same_roi(&output));
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn stage_edits_surface_on_the_roi_as_stage_changes() {
        let roi = Roi::pipeline("p");
        let log: Rc<RefCell<Vec<AttrNames>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        roi.signals()
            .changed()
            .connect(move |(_, attrs): &(String, AttrNames)| {
                sink.borrow_mut().push(attrs.clone());
            });

        let stage = PipelineStage::grow_from_seed_point();
        roi.stages().unwrap().append(stage.clone()).unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            [Some(vec!["stages".to_string()])].as_slice()
        );

        log.borrow_mut().clear();
        stage.set_radius(Some(2.0)).unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            [Some(vec!["stages".to_string()])].as_slice()
        );
    }

    // ── Context propagation ──

    #[test]
    fn pipeline_context_reaches_present_and_arriving_stages() {
        let context = ctx();
        let roi = Roi::pipeline("p");
        let early = PipelineStage::grow_from_seed_point();
        roi.stages().unwrap().append(early.clone()).unwrap();
        assert!(early.context().is_none());

        roi.set_context(Some(Rc::clone(&context)));
        assert!(early.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));

        let late = PipelineStage::passthrough();
        roi.stages().unwrap().append(late.clone()).unwrap();
        assert!(late.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));
    }

    #[test]
    fn collection_hands_context_to_entering_rois() {
        let context = ctx();
        let collection = RoiCollection::new();
        collection.set_context(Some(Rc::clone(&context)));

        let pipeline = selection_pipeline(&ctx(), 1.5);
        pipeline.set_context(None);
        collection.add(pipeline.clone()).unwrap();
        assert!(pipeline.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));
        // And down into the stages.
        let select = pipeline.stages().unwrap().get(0).unwrap();
        assert!(select.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));
    }

    #[test]
    fn collection_rebind_fans_out_to_residents() {
        let collection = RoiCollection::new();
        let a = Roi::surface("a");
        let b = Roi::surface("b");
        collection.add(a.clone()).unwrap();
        collection.add(b.clone()).unwrap();
        assert!(a.context().is_none());

        let context = ctx();
        collection.set_context(Some(Rc::clone(&context)));
        assert!(a.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));
        assert!(b.context().is_some_and(|c| Rc::ptr_eq(&c, &context)));
    }

    // ── Collection behavior ──

    #[test]
    fn rename_moves_the_roi_and_collisions_fail_cleanly() {
        let collection = RoiCollection::new();
        let a = Roi::surface("a");
        collection.add(a.clone()).unwrap();
        collection.add(Roi::surface("b")).unwrap();

        collection.rename("a", "c".to_string()).unwrap();
        assert_eq!(a.key(), "c");
        assert!(collection.get("c").unwrap().same_roi(&a));

        assert!(matches!(
            collection.rename("c", "b".to_string()),
            Err(RoiError::Model(ModelError::KeyCollision { .. }))
        ));
        assert_eq!(collection.keys(), vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn delete_returns_the_removed_rois() {
        let collection = RoiCollection::new();
        collection.add(Roi::surface("a")).unwrap();
        collection.add(Roi::surface("b")).unwrap();
        let removed = collection.delete(&["a".to_string()]).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key(), "a");
        assert_eq!(collection.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn batched_visibility_write_notifies_once() {
        let collection = RoiCollection::new();
        collection.add(Roi::surface("a")).unwrap();
        collection.add(Roi::surface("b")).unwrap();

        let log: Rc<RefCell<Vec<(Vec<String>, AttrNames)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        collection
            .signals()
            .items_changed()
            .connect(move |ev: &(Vec<String>, AttrNames)| {
                sink.borrow_mut().push(ev.clone());
            });

        let keys = vec!["a".to_string(), "b".to_string()];
        let visibility = column(
            "isVisible",
            vec![false, true],
            |roi: &Roi| roi.visible(),
            |roi, value| roi.set_visible(value),
        );
        collection.set_attr_for_many(&keys, &[&visibility]).unwrap();

        // Only `a` actually changed.
        assert_eq!(
            log.borrow().as_slice(),
            [(
                vec!["a".to_string()],
                Some(vec!["isVisible".to_string()])
            )]
            .as_slice()
        );
        assert!(!collection.get("a").unwrap().visible());
        assert!(collection.get("b").unwrap().visible());
    }

    #[test]
    fn collection_round_trips_byte_equal() {
        let registry = StageRegistry::builtin();
        let collection = RoiCollection::new();

        let surface = Roi::surface("hotspot");
        surface.set_mesh_key(Some("gm".to_string())).unwrap();
        surface.set_vertex_indices(Some(vec![1, 4])).unwrap();
        collection.add(surface).unwrap();
        collection.add(selection_pipeline(&ctx(), 2.0)).unwrap();

        let saved = collection.to_list();
        let as_text = |list: &[Map<String, Value>]| {
            serde_json::to_string(&Value::Array(
                list.iter().map(|d| Value::Object(d.clone())).collect(),
            ))
            .unwrap()
        };

        let reloaded = RoiCollection::from_list(&registry, &saved).unwrap();
        assert_eq!(as_text(&saved), as_text(&reloaded.to_list()));
        assert_eq!(reloaded.keys(), collection.keys());
    }

    #[test]
    fn from_list_lets_later_duplicates_win() {
        let registry = StageRegistry::builtin();
        let hidden = Roi::surface("x");
        hidden.set_visible(false);
        let list = vec![Roi::surface("x").to_dict(), hidden.to_dict()];
        let collection = RoiCollection::from_list(&registry, &list).unwrap();
        assert_eq!(collection.len(), 1);
        assert!(!collection.get("x").unwrap().visible());
    }
}
