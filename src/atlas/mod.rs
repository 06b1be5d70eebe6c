//! Atlas — the multi-map store this worker operates on.
//!
//! The [`Atlas`] owns every keyframe and map point in the system; each
//! [`Map`] is a set of entity ids sharing a coordinate frame. Keeping the
//! entities in one place makes map merging a matter of moving ids between
//! sets.

pub mod atlas;
pub mod keyframe;
pub mod keyframe_db;
pub mod map;
pub mod map_point;
pub mod types;

pub use atlas::Atlas;
pub use keyframe::KeyFrame;
pub use keyframe_db::{BowVector, KeyFrameDatabase};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapId, MapPointId};
