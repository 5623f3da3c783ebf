//! Conversational Financial Agent Backend
//!
//! A chat backend that lets an end user drive financial operations
//! (registration, login, accounts, payments, trading quotes) through
//! natural language:
//! - A tool-calling language model decides what to do each turn
//! - The turn orchestrator runs the bounded inference/tool loop
//! - The status resolver derives where the conversation stands
//! - Sessions survive restarts through a durable JSON store
//!
//! TURN LOOP:
//! MESSAGE → INFER → DISPATCH TOOLS → FEED RESULTS → ... → FINAL REPLY

pub mod api;
pub mod error;
pub mod gemini;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod status;
pub mod store;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use status::ConversationStatus;
