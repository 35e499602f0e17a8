//! User Interface layer
//!
//! This module contains all UI-related code:
//! - Theme definitions and colors
//! - Reusable widgets (popups, status bar)
//! - The main render function

pub mod render;
pub mod theme;
pub mod widgets;

pub use render::render;
pub use theme::Theme;
