pub mod columnar;
pub mod error;
pub mod feature;
pub mod mvt;

pub use columnar::*;
pub use error::*;
pub use feature::*;
