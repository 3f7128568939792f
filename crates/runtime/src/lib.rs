pub mod batch;
pub mod event_bus;

pub use batch::*;
pub use event_bus::*;
