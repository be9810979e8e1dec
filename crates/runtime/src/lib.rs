pub mod cancel;
pub mod debounce;
pub mod dispatcher;
pub mod pending;

pub use cancel::*;
pub use debounce::*;
pub use dispatcher::*;
pub use pending::*;
