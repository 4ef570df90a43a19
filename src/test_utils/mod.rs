//! Test utilities for `viz-scope`
//!
//! Provides synthetic stream generation and test helpers for validating
//! the frame assembly pipeline without the camera attached.

pub mod stream_generator;

pub use stream_generator::*;
