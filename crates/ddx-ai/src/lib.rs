//! Model-facing half of the ddx pipeline: the model client, the map and
//! reduce phases, and the driver that runs them per field.

pub mod client;
pub mod map;
pub mod options;
pub mod pipeline;
pub mod reduce;

#[cfg(test)]
mod testing;

pub use client::{ModelClient, ModelError, OpenAiClient};
pub use options::PipelineOptions;
pub use pipeline::Pipeline;
