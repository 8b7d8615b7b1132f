//! These models represent the objects passed around by the advisor
//!
//! There are several different related formats we need to interact with:
//! - stream events, sent from the server to the chat interface as SSE frames
//! - chat messages, the visible and persisted history of a conversation
//! - model messages/tools, sent from the advisor to the LLM
//!
//! Chat messages are converted into model messages right before a model call;
//! stream events are produced from model output and folded back into chat
//! messages by the stream processor.
pub mod chat;
pub mod component;
pub mod event;
pub mod message;
pub mod role;
pub mod tool;
