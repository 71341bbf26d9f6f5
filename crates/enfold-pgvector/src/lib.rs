//! PostgreSQL pgvector backend for Enfold.
//!
//! Implements the core's `VectorIndex` seam over a single pgvector table
//! holding both representation layers. In production this is the *fallback*
//! store: the dual selector routes here with reduced fan-out when the
//! primary backend's breaker is open or its health probe fails.

mod index;

pub use index::{PgVectorIndex, DEFAULT_EMBEDDING_DIM};
