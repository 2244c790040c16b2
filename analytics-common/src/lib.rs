pub mod event;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod shutdown;
pub mod store;
