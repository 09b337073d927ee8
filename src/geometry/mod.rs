//! In-memory geometry and its text formats.
//!
//! | Type | Format | Notes |
//! |---|---|---|
//! | [`Skeleton`] | SWC | rooted trees of nodes with radius and parent |
//! | [`Mesh`] | Wavefront OBJ | triangle soup, 1-based face indices |
//!
//! The module is split into:
//! - **Skeleton**: validated node forest, SWC read/write, cable length
//! - **Mesh**: triangle mesh, OBJ read/write, tube synthesis from a skeleton

mod mesh;
mod skeleton;

pub use mesh::{Mesh, MeshError, TUBE_SIDES, tube_mesh};
pub use skeleton::{Node, Skeleton, SkeletonError};
