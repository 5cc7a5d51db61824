//! Social card renderer: serves PNG cards from an object-store cache and renders
//! them with headless Chromium on a miss.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
