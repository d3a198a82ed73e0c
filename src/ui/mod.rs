pub mod icons;
pub mod progress;
pub mod report;

pub use progress::StageProgress;
pub use report::{print_execution, print_failure, print_stage_summary};
