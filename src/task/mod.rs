//! The task data model and its re-entrant stage driver.

pub mod model;
pub mod state_machine;

pub use model::{flags, Stage, Task, ALL_STAGES};
pub use state_machine::{advance, StageHooks};
