// src/lib.rs
pub mod ports {
    pub mod gateway;
    pub mod replay_gateway;
}
pub mod arbitrage;
pub mod config;
pub mod model;
pub mod position;
pub mod pricing;
pub mod rate_limit_notifier;
pub mod spread;
pub mod status;
pub mod trade {
    pub mod execution {
        pub mod gateway_box;
        pub mod order_executor;
    }
}
pub mod venue;

#[cfg(test)]
mod testing;
