//! Host-side types for the raykit acceleration structure layer.
//!
//! This crate provides the data that exists before anything touches the GPU:
//! - The ray tracing vertex format shared by every mesh
//! - CPU mesh data with validation of index ranges
//! - Ray and triangle math used by the host reference tracer
//! - Common error types

pub mod error;
pub mod math;
pub mod mesh;

pub use error::{Error, Result};
pub use math::{intersect_triangle, Ray, TriangleHit};
pub use mesh::{AsVertex, MeshData};
