//! Database engines
//!
//! - [`memory`]: embedded, in-process engine (`memory:` URLs)
//! - [`neo4j`]: remote Neo4j server (`bolt://`, `neo4j://` URLs)

pub mod memory;
pub mod neo4j;

pub use memory::{Fault, FaultPoint, MemoryDatabase, MemoryEngine, SessionStats};
pub use neo4j::Neo4jEngine;
