//! Durable storage for rooms, messages, receipts, identity lookups,
//! and the presence locator table.

pub mod chat_store;

pub use chat_store::ChatStore;
