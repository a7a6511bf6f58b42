//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{DoseField, StructureKind, StructureMask, VoxelGrid};
pub use crate::error::{EvalError, EvalResult};

pub use crate::dvh::{DvhCurve, DvhSummary};

pub use crate::radbio::params::{
    standard_params, LkbParams, ModelParams, OrganParams, SerialityParams, TargetParams,
};
pub use crate::radbio::{
    evaluate_plan, PlanEvaluation, SkippedStructure, StructureEvaluation,
};

pub use crate::gamma::{GammaCriteria, GammaResult, Normalization, QaVerdict};

pub use crate::consts::{
    DEFAULT_DISTANCE_CRITERIA_MM, DEFAULT_DOSE_CRITERIA_PCT, DEFAULT_THRESHOLD_PCT,
};
