//! Inbound overlay commands.
//!
//! This module serialises mutations per overlay name and composes the
//! registry, link table and redeploy coordinator behind one facade.

mod manager;

pub use manager::{ManagerStats, OverlayManager};
