//! Built-in MapReduce applications.

pub mod wc;
