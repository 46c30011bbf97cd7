//! OpenAI-compatible wire shapes: events, error envelopes, requests, and the
//! chat-completions compatibility mapping.

pub mod chat;
pub mod models;
pub mod requests;
