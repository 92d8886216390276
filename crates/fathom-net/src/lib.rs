//! Fathom wire transport — RPC client/server and the sonar data plane.

pub mod client;
pub mod endpoint;
pub mod pacer;
pub mod queue;
pub mod reassembly;
pub mod server;
pub mod session;

mod rpc_client;

pub use client::SonarClient;
pub use server::SonarServer;
