//! ts_types
//!
//! Plain data shared by the treeshop orchestration engine and its command line wrapper:
//! manifests, worker identities, resolved samples, stage definitions and provenance records.

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

pub mod errors;
pub mod layout;
pub mod manifest;
pub mod provenance;
pub mod sample;
pub mod stage;
pub mod worker;

pub use errors::ConfigError;
pub use layout::StorageLayout;
pub use manifest::Manifest;
pub use provenance::ProvenanceRecord;
pub use sample::{ReadFileKind, ReadPair, ResolutionMethod, Sample};
pub use stage::{ArtifactSpec, DockerImage, Optionality, PipelineStage, Placement, ToolIdentity};
pub use worker::{Machine, WorkerIdentity, WorkerShard};
