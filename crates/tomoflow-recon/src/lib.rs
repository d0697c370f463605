//! Concrete reconstruction stages for the tomoflow pipeline.
//!
//! The typical online graph is
//! receiver → H2D → reordering → interpolation → attenuation →
//! back-projection → masking → D2H → saver,
//! with every compute stage scheduled across all devices by the shared
//! fan-out engine.

pub mod attenuation;
pub mod backprojection;
pub mod copy;
pub mod geometry;
pub mod his;
pub mod interpolation;
pub mod masking;
pub mod offline;
pub mod receiver;
pub mod reordering;

pub use geometry::ScanGeometry;
pub use his::HisLoader;
pub use offline::{OfflineLoader, OfflineSaver};
pub use receiver::Receiver;
