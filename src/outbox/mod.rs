pub mod dispatcher;

pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
