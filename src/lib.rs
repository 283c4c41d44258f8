//! Dnsgate - a filtering DNS forwarder.
//!
//! Dnsgate receives DNS queries over UDP and TCP, matches them against
//! adblock/hosts-style rule lists, forwards what survives to upstream
//! servers and rewrites or synthesizes the answers on the way back.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`filter`]: Rule parsing, the multi-table index and the matcher
//! - [`cache`]: Response caching with per-entry TTL and optimistic serve
//! - [`upstream`]: The upstream exchange capability
//! - [`forwarder`]: The per-query state machine and response rewriting
//! - [`server`]: Server orchestration
//! - [`event`]: Per-query events observed by callers
//! - [`error`]: Error types
//!
//! # Testing
//!
//! All components are designed with trait-based abstractions to enable
//! comprehensive testing without network access:
//!
//! ```rust
//! use dnsgate::filter::{Engine, FilterParams};
//! use hickory_proto::rr::RecordType;
//!
//! let (engine, _) = Engine::new(
//!     vec![FilterParams::in_memory(1, "||tracking.example^\n")],
//!     0,
//! );
//! assert!(engine.matches("ads.tracking.example", RecordType::A));
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod forwarder;
pub mod server;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
pub use forwarder::Forwarder;
