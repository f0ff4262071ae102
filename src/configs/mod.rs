pub mod base;
pub mod gateway;
pub mod logging;
pub mod session;

pub use base::*;
pub use gateway::*;
pub use logging::*;
pub use session::*;
