//! Property report rendering service: a template renderer and a headless
//! browser PDF converter fed by a durable job queue, a worker pool and a
//! recurring scheduler.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
