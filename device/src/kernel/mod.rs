//! Cooperative scheduling primitives shared by the mesh stack.

pub mod sem;
pub mod work;
