pub mod case;
pub mod commands;
pub mod config;
pub mod convert;
pub mod fetch;
pub mod hpc;
pub mod logging;
pub mod mesh;
pub mod metrics;
pub mod naca;
pub mod pipeline;
pub mod post;
pub mod profile;
pub mod sketch;
pub mod step;
