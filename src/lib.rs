pub mod category;
pub mod panic_handler;
pub mod render;
pub mod settings;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use category::Category;
pub use render::{Bitmap, RenderEngine, RenderError};
pub use sync::{SyncResult, SyncStateMachine, SyncUpdate};
