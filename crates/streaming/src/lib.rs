pub mod archive;
pub mod config;
pub mod error;
pub mod events;
pub mod fgb;
pub mod pipeline;
pub mod pmtiles;
pub mod request;
pub mod scheduler;
pub mod spatial;
pub mod transform;
pub mod viewport;

pub use archive::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use fgb::*;
pub use pipeline::*;
pub use pmtiles::*;
pub use request::*;
pub use scheduler::*;
pub use spatial::*;
pub use transform::*;
pub use viewport::*;
