pub mod protocol;
mod server;

pub use server::StratumServer;
