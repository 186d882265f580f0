pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod journal;
pub mod limiter;
pub mod proxy;
pub mod response;
pub mod server;
pub mod store;
pub mod tools;
