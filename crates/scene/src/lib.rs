pub mod error;
pub mod feature;
pub mod geojson;
pub mod ids;
pub mod store;
pub mod visibility;

pub use error::*;
pub use feature::*;
pub use store::*;
pub use visibility::*;
