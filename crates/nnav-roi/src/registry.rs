//! Tag-to-constructor registry for pipeline stages.
//!
//! Deserialization dispatches on the `"type"` field of a stage dict. The
//! registry owning that mapping is plain data passed by reference to
//! whatever needs to rebuild stages; there is no process-global table, so
//! two documents with different stage vocabularies can coexist in one
//! process.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Result, RoiError};
use crate::stage::{
    PipelineStage, passthrough_from_dict, seed_line_from_dict, seed_point_from_dict,
    select_from_dict,
};

/// Builds a stage from its dict body, with the `"type"` field already
/// stripped.
pub type StageCtor = fn(&Map<String, Value>) -> Result<PipelineStage>;

/// Maps stage wire tags to constructors.
#[derive(Clone, Debug, Default)]
pub struct StageRegistry {
    ctors: BTreeMap<String, StageCtor>,
}

impl StageRegistry {
    /// A registry with no stage kinds at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry carrying every built-in stage kind.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (tag, ctor) in [
            ("Passthrough", passthrough_from_dict as StageCtor),
            ("SelectSurfaceMesh", select_from_dict),
            ("AddFromSeedPoint", seed_point_from_dict),
            ("AddFromSeedLines", seed_line_from_dict),
        ] {
            // Built-in tags are distinct; registering them cannot fail.
            let _ = registry.register(tag, ctor);
        }
        registry
    }

    /// Registers a constructor under `tag`. Tags are single-owner.
    pub fn register(&mut self, tag: &str, ctor: StageCtor) -> Result<()> {
        if self.ctors.contains_key(tag) {
            return Err(RoiError::DuplicateStageType(tag.to_string()));
        }
        self.ctors.insert(tag.to_string(), ctor);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.ctors.contains_key(tag)
    }

    /// Registered tags in sorted order.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Rebuilds a stage from its dict form, dispatching on `"type"`.
    pub fn build(&self, dict: &Map<String, Value>) -> Result<PipelineStage> {
        let Some(tag) = dict.get("type").and_then(Value::as_str) else {
            return Err(RoiError::MissingType);
        };
        let Some(ctor) = self.ctors.get(tag) else {
            return Err(RoiError::UnknownStageType(tag.to_string()));
        };
        let mut body = dict.clone();
        body.remove("type");
        ctor(&body)
    }
}
