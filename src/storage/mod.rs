//! Durable exchange archive

mod traffic_store;

pub use traffic_store::TrafficStore;
