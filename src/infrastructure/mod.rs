pub mod event_bus;
pub mod order_cache;
pub mod outbox;
pub mod persistence;
pub mod price_store;
pub mod trade_queue;
