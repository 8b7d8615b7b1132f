pub mod advisor;
pub mod codec;
pub mod errors;
pub mod models;
pub mod processor;
pub mod prompt_template;
pub mod providers;
pub mod queue;
pub mod sequence;
pub mod store;
