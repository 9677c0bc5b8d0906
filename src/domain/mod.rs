pub mod auction;
pub mod errors;
pub mod events;
pub mod merge;
pub mod outbox;
pub mod ports;
