pub mod chunk;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fetch_sse;
pub mod smooth;
pub mod speed;
pub mod sse;
pub mod transport;
