// Saved replays and buffer storage

pub mod export;
pub mod storage;

pub use export::{ExportError, ExportOutcome, ExportPlan, NotReadyReason};
pub use storage::{ensure_dirs, output_path_for};
