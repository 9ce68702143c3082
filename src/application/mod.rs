//! Application services: rendering, conversion, job processing and scheduling.

pub mod convert;
pub mod error;
pub mod jobs;
pub mod render;
pub mod repos;
pub mod scheduler;
