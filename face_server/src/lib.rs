pub mod endpoints;
pub mod loader;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod pipeline;
pub mod poller;
pub mod store;
pub mod utils;
