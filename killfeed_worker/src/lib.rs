#![forbid(unsafe_code)]

pub mod cli;
pub mod dev_backends;
