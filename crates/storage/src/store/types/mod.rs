#![forbid(unsafe_code)]

mod jobs;
mod streams;

pub use jobs::*;
pub use streams::*;
