pub mod location;
pub mod notify;
pub mod offer;
pub mod presence;
pub mod progress;
pub mod session;
