pub mod codec;
pub mod request;
pub mod response;

pub use codec::*;
pub use request::*;
pub use response::*;
