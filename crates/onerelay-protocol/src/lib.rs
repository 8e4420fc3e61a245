//! OpenAI-shaped wire types spoken on the inbound side of the relay, plus the
//! line framing used by event-stream responses.

pub mod openai;
pub mod sse;
