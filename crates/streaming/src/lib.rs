pub mod inflight;
pub mod loader;
pub mod request;

pub use inflight::*;
pub use loader::*;
pub use request::*;
