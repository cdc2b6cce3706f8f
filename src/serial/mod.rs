mod cache;
mod daemon;
pub mod port;
pub mod supervisor;
pub mod types;

pub use supervisor::SerialSupervisor;
pub use types::{PortError, SerialRequest, SerialResponse};
