//! Data Models
//!
//! This module contains the core data structures of the graph store:
//!
//! - `Node` / `Property` - rows of the two persisted tables
//! - `AssembledNode` - a node materialized with supertags and grouped properties
//! - `system` - built-in fields and supertags seeded at bootstrap
//!
//! Fields and supertags are themselves nodes, identified by system ids.

mod assembled;
mod node;
pub mod system;

pub use assembled::AssembledNode;
pub use node::{CreateNodeParams, Node, Property, ValidationError};
