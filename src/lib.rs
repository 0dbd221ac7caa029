pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod framer;
pub mod gate;
pub mod identity;
pub mod prompt;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod upstream;
