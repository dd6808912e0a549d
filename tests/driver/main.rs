#![allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc
)]

#[path = "../common/mod.rs"]
mod common;

mod concurrency;
mod failures;
mod fidelity;
mod resume;
mod stopping;
