pub mod cluster;
pub mod events;
pub mod extract;
pub mod filter;
pub mod lifecycle;
pub mod projections;
pub mod surface;
pub mod visibility;
pub mod zoom;

pub use cluster::*;
pub use events::*;
pub use filter::*;
pub use lifecycle::*;
pub use projections::*;
pub use surface::*;
pub use visibility::*;
pub use zoom::*;
