//! Application services: the render-or-serve pipeline and cache purging.

pub mod error;
pub mod pipeline;
pub mod purge;
pub mod render;
