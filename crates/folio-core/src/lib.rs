//! folio-core: conversation data model and producer event types
//!
//! This crate holds the types shared by the session engine and the server:
//! conversations, messages, in-flight stream snapshots, and the ordered event
//! stream a response producer emits.

pub mod error;
pub mod stream;
pub mod types;

pub use error::{Error, Result, is_context_overflow};
pub use stream::{ProducerEvent, ProducerEventStream};
pub use types::*;
