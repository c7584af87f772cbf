pub mod client_cache;
pub mod credential_store;
pub mod encryption;
pub mod query_compiler;
pub mod query_service;
pub mod results_cache; // Object-store results cache with TTL
pub mod ssh_tunnel;
pub mod warehouse; // Warehouse clients, one per dialect

pub use client_cache::*;
pub use credential_store::*;
pub use encryption::*;
pub use query_compiler::*;
pub use query_service::*;
pub use results_cache::*;
pub use ssh_tunnel::*;
