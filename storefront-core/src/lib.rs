//! Streaming conversation client for the storefront assistant
//!
//! This crate provides:
//! - **Decoding**: `FrameDecoder` turns response chunks into complete `data:` lines
//! - **Interpretation**: `interpret` classifies each line into a `FrameAction`
//! - **Reconciliation**: `Conversation` applies actions to the message log
//! - **Sessions**: `ChatController` runs one exchange at a time over a `ChatTransport`
//! - **Persistence**: `HistoryStore` with `FileHistoryStore` and `MemoryHistoryStore`
//!
//! # Example
//!
//! ```ignore
//! use storefront_core::{ChatController, HttpTransport, FileHistoryStore};
//!
//! let controller = ChatController::restore(transport, store, collaborators, config).await;
//! controller.submit("Do you have eggless cakes?");
//! while let Some(event) = controller.next_event().await { /* render */ }
//! ```
pub mod collaborators;
pub mod controller;
pub mod conversation;
pub mod decoder;
pub mod frame;
pub mod message;
pub mod persistence;
pub mod traffic_log;
pub mod transport;

pub use collaborators::{CartSink, DiagnosticSink, Navigator, Notice, NoticeAction, NoticeKind, Notifier};
pub use controller::{ChatController, Collaborators, ControllerConfig, ControllerEvent};
pub use conversation::{Conversation, Effect};
pub use decoder::{FrameDecoder, Line};
pub use frame::{FrameAction, SkipReason, interpret};
pub use message::{CartItem, HistoryTurn, Message, MessageId, Product, Role};
pub use persistence::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
pub use transport::{ByteStream, ChatRequest, ChatTransport, HttpTransport};
