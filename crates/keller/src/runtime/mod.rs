//! The environment lifecycle: staged acquire and reverse release.

mod lifecycle;
mod stage;
mod state;

pub use lifecycle::{compose_argv, start, stop, ROOT_PLACEHOLDER, SYSTEM_FS};
pub use stage::Stage;
pub use state::State;
