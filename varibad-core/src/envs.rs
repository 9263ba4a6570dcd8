//! Environments bundled with the library.
mod grid_navi;
pub use grid_navi::{GridNavi, GridNaviBuilder, GridNaviConfig};
