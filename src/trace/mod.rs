pub mod engine;
pub mod pending;
pub mod receiver;
pub mod transport;

pub use engine::*;
pub use pending::*;
pub use receiver::*;
pub use transport::*;
