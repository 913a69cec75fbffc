//! # OnSocial Relayer
//!
//! A gasless meta-transaction relayer. Forwards user-signed requests to the
//! OnSocial contract, which verifies signatures on-chain, and pays the gas
//! from a fixed pool of function-call access keys on one relayer account.
//!
//! Each key has its own nonce sequence, so concurrency is bounded by the pool
//! size and no two in-flight transactions ever share a (key, nonce) pair.
//!
//! ## Quick Start
//! ```bash
//! RELAYER_KEYS_JSON='[...]' cargo run --bin onsocial-relayer
//! ```
//!
//! ## Endpoints
//! - `POST /execute` - Forward a signed request to the contract
//! - `GET /health` - Liveness with pool and RPC status
//! - `GET /ready` - 200 only while accepting traffic
//! - `GET /metrics` - Prometheus text metrics
//! - `GET /tx/{tx_hash}` - Final status of a relayed transaction

pub mod chain;
pub mod config;
pub mod drain;
mod error;
mod handlers;
pub mod health;
pub mod key_pool;
pub mod key_store;
pub mod metrics;
mod middleware;
pub mod relay;
pub mod request;
mod response;
pub mod retry;
mod router;
pub mod rpc;
mod state;
pub mod submitter;

pub use config::Config;
pub use drain::DrainCoordinator;
pub use error::{Error, RelayError};
pub use health::{Health, Lifecycle};
pub use key_pool::KeyPool;
pub use key_store::KeyStore;
pub use router::create as create_router;
pub use rpc::RpcClient;
pub use state::AppState;
