//! Learning & diagnosis: categorize failures, persist what was learned,
//! decay and bound it over time.

pub mod collector;
pub mod diagnosis;
pub mod gc;
pub mod storage;

pub use collector::{LearnedItem, LearnedKind, LearningCollector};
pub use diagnosis::{DiagnosisReport, ErrorSignature, FailureCategory, categorize, diagnose};
pub use gc::{GcStats, LearningGc};
pub use storage::LearningStorage;
