//! Orchestration for a meilibridge process: the three sync pipelines
//! (spec.md §4.4-§4.6), the process-wide engine registry, the per-bridge
//! [`syncer::Syncer`] abstraction, and the supervisor that wires a loaded
//! [`meilibridge_config::Config`] into running pipelines.

pub mod bulk;
pub mod change_stream;
pub mod engine_registry;
pub mod supervisor;
pub mod syncer;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine_registry::EngineRegistry;
pub use syncer::Syncer;
