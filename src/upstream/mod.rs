mod client;
mod monitor;

pub use client::{GetWork, PendingBlock, RpcClient, UpstreamApi};
pub use monitor::UpstreamSet;
