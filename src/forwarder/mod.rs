//! The forwarding pipeline.
//!
//! [`Forwarder`] threads every request through retransmission detection,
//! the response cache, the rule engine, upstream exchange and response
//! rewriting. [`rewriter`] holds the synthesis logic, [`retransmission`] the
//! duplicate-client-query detector.

mod handler;
pub mod retransmission;
pub mod rewriter;

pub use handler::{Forwarder, MessageInfo, Transport};
