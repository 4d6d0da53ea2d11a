//! IPC module for communication with the dashboard and other local clients

mod protocol;
mod server;

pub use server::Server;
