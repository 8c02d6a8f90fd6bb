//! Error taxonomy for ROI entities and pipelines.
//!
//! Data-integrity problems (unknown type tags, malformed dicts) and misuse
//! of the typed accessors (wrong entity kind, wrong stage kind) are
//! reported here. A stage that is merely not yet configured is not an
//! error: processing degrades to a logged no-op instead.

use nnav_model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoiError {
    /// A stage dict named a type tag the registry does not know.
    #[error("unknown stage type `{0}`")]
    UnknownStageType(String),

    /// A second constructor was registered under an existing tag.
    #[error("stage type `{0}` is already registered")]
    DuplicateStageType(String),

    /// An ROI dict named a type tag outside the known ROI kinds.
    #[error("unknown roi type `{0}`")]
    UnknownRoiType(String),

    /// A dict that must carry a `"type"` tag does not.
    #[error("dict is missing its \"type\" field")]
    MissingType,

    /// A typed setter was called on a stage kind without that attribute.
    #[error("stage `{stage}` has no attribute `{attribute}`")]
    AttributeNotOnStage {
        stage: String,
        attribute: &'static str,
    },

    /// A pipeline-only operation was called on a surface ROI.
    #[error("roi `{0}` is not a pipeline")]
    NotAPipeline(String),

    /// A surface-only operation was called on a pipeline ROI.
    #[error("roi `{0}` is not a surface selection")]
    NotASurface(String),

    /// Color components must lie in `[0, 1]`.
    #[error("invalid color: {0}")]
    InvalidColor(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Deserialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RoiError>;
