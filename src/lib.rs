pub mod artifacts;
pub mod batch;
pub mod config;
pub mod data;
pub mod folds;
pub mod frames;
pub mod grid;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod progress;
pub mod recipe;
pub mod split;
pub mod tune;
pub mod workflow;
