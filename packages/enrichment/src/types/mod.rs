//! Data types shared across the pipeline.

pub mod account;
pub mod plan;
pub mod result;
pub mod row;
