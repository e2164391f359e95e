//! ts_wrap
//!
//! Process plumbing for the `treeshop` command: environment probing, logging and the
//! per-worker launcher.

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

pub mod env;
pub mod launch;
pub mod utils;
