#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod classify;
pub mod engine;
pub mod error;
pub mod extract;
pub mod framer;
pub mod geo;
pub mod inform;
pub mod output;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod sanitize;
