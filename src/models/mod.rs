//! Captured-traffic data model

mod exchange;

pub use exchange::{
    Exchange, ExchangeCompletion, ExchangeFilter, OpenExchange, StatusBucket,
};
