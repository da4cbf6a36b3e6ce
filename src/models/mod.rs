pub mod events;
pub mod offer;
pub mod order;
pub mod presence;
