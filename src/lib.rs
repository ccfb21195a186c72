pub use wxcore;

pub mod types {
    pub mod events;
}

pub mod bridge;
pub mod client;
pub mod config;
pub mod containers;
pub mod error;
pub mod formatter;
pub mod handlers;
pub mod http;
pub mod identity;
pub mod image;
pub mod local;
pub mod locks;
pub mod portal;
pub mod puppet;
pub mod request;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod user;

pub use bridge::{Bridge, BridgeContext};
pub use client::Client;
pub use config::Config;

pub mod test_utils;
