//! ts_lib
//!
//! The sample orchestration engine: partitions a manifest across a static pool of workers,
//! resolves every assigned sample to one canonical read pair, runs the ordered chain of
//! containerized analysis stages on the worker and records the provenance of each stage that
//! completes.

// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms
)]
#![warn(unused)]
// Other warnings (as of rust 1.55)
#![deny(
    bindings_with_variant_name,
    confusable_idents,
    const_item_mutation,
    deprecated,
    drop_bounds,
    elided_lifetimes_in_paths,
    irrefutable_let_patterns,
    non_shorthand_field_patterns,
    overlapping_range_endpoints,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]

pub mod command;
pub mod config;
pub mod converter;
pub mod error_log;
pub mod executor;
pub mod maintenance;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod provenance;
pub mod remote;
pub mod resolver;
pub mod scratch;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use executor::{SampleOutcome, StageExecutor, StageSelection};
pub use orchestrator::{check, process, CheckReport, ProcessOptions, RunSummary};
pub use partition::partition;
pub use pipeline::Pipeline;
pub use provenance::ProvenanceRecorder;
pub use resolver::{InputResolver, ResolutionPlan, ResolveError};
