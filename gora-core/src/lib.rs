//! Gora-Core
//!
//! Types shared by every gora process: the JSON envelopes exchanged over the
//! broker and the broker abstraction itself, with an in-process implementation.

pub mod broker;
pub mod message;
