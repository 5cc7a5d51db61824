//! Card rendering: the engine port, template lookup, and the Chromium-backed
//! implementation with its browser pool.

mod chromium;
mod pool;
mod templates;
mod types;

pub use chromium::{ChromiumEngine, ChromiumOptions, LaunchError};
pub use pool::{CheckoutError, Pool, PoolManager, Pooled};
pub use templates::TemplateCatalog;
pub use types::{RenderEngine, RenderError, RenderJob};
