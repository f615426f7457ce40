pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod log;
pub mod operation;
pub mod transport;

pub use clock::*;
pub use entity::*;
pub use error::*;
pub use id::*;
pub use log::*;
pub use operation::*;
pub use transport::*;
