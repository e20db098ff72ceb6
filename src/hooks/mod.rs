//! Hook service integration.
//!
//! Pre/post-stage filters run in an external HTTP service and may
//! transform prompts, responses, and extracted data.

pub mod client;
