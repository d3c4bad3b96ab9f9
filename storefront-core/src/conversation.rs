//! The conversation log and the reducer that applies frame actions to it.
//!
//! All mutation of the log goes through [`Conversation`]. It performs no I/O:
//! side effects are returned as [`Effect`]s for the caller to run.

use tracing::debug;

use crate::collaborators::Notice;
use crate::frame::FrameAction;
use crate::message::{CartItem, HistoryTurn, Message, MessageId, Role};

pub const WELCOME_MESSAGE: &str = "Hello! I'm your dessert shop assistant. I can help with our menu, orders, delivery options, ingredients, and anything else about our desserts. How can I help you today?";
pub const COMPLETION_FALLBACK: &str =
    "I can help you with our desserts! What would you like to know?";
pub const CHECKOUT_READY: &str =
    "Your order is ready for checkout. Use the payment link to complete it.";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

/// A side effect requested by a reduction.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    AddToCart(CartItem),
    Notify(Notice),
    /// The log has no open placeholder anymore and may be persisted
    Settled,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    next_id: u64,
    placeholder: Option<MessageId>,
}

impl Conversation {
    /// Build a conversation from restored messages. Anything still marked as
    /// streaming is settled first, so the log never starts with an open placeholder.
    pub fn new(messages: Vec<Message>) -> Self {
        let mut conversation = Conversation {
            messages: Vec::new(),
            next_id: 1,
            placeholder: None,
        };
        conversation.reset(messages);
        conversation
    }

    pub fn welcome() -> Self {
        Self::new(vec![welcome_message()])
    }

    /// Replace the log. Ids handed out later stay above every id used so
    /// far, including ids from the replaced log.
    pub fn reset(&mut self, messages: Vec<Message>) {
        self.messages = messages
            .into_iter()
            .filter(|m| !(m.is_streaming && m.text().is_empty()))
            .map(|m| Message {
                is_streaming: false,
                ..m
            })
            .collect();
        let above_restored = self.messages.iter().map(|m| m.id.0).max().unwrap_or(0) + 1;
        self.next_id = self.next_id.max(above_restored);
        self.placeholder = None;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.placeholder.is_some()
    }

    pub fn placeholder_id(&self) -> Option<MessageId> {
        self.placeholder
    }

    /// The most recent `limit` settled, non-empty user/assistant turns.
    pub fn history(&self, limit: usize) -> Vec<HistoryTurn> {
        let turns: Vec<HistoryTurn> = self
            .messages
            .iter()
            .filter(|m| m.role.is_content_bearing() && !m.is_streaming)
            .filter(|m| !m.text().trim().is_empty())
            .map(|m| HistoryTurn {
                role: m.role,
                content: m.text().to_string(),
            })
            .collect();
        let skip = turns.len().saturating_sub(limit);
        turns.into_iter().skip(skip).collect()
    }

    /// Start an exchange: append the user's message and an open assistant
    /// placeholder. Returns None when an exchange is already open or the text
    /// is blank.
    pub fn begin(&mut self, user_text: &str) -> Option<MessageId> {
        let text = user_text.trim();
        if self.is_streaming() || text.is_empty() {
            return None;
        }
        let user_id = self.allocate_id();
        self.messages.push(Message::user(user_id, text));

        let placeholder = self.allocate_id();
        self.messages.push(Message::placeholder(placeholder));
        self.placeholder = Some(placeholder);
        Some(placeholder)
    }

    /// Apply one action to the open exchange.
    pub fn apply(&mut self, action: FrameAction) -> Vec<Effect> {
        let Some(index) = self.placeholder_index() else {
            debug!(?action, "no open placeholder, ignoring action");
            return Vec::new();
        };

        match action {
            FrameAction::AppendDelta(delta) => {
                if !delta.is_empty() {
                    self.messages[index]
                        .content
                        .get_or_insert_with(String::new)
                        .push_str(&delta);
                }
                Vec::new()
            }
            FrameAction::ShowProducts(products) => {
                let id = self.allocate_id();
                self.messages.insert(index, Message::product_list(id, products));
                Vec::new()
            }
            FrameAction::MutateCart(items) => {
                if items.is_empty() {
                    return Vec::new();
                }
                let names = items
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut effects: Vec<Effect> = items.into_iter().map(Effect::AddToCart).collect();
                effects.push(Effect::Notify(Notice::success(format!(
                    "Added {names} to cart!"
                ))));
                effects
            }
            FrameAction::RequireAuth { message } => {
                self.finalize(index, &message, false);
                vec![
                    Effect::Notify(Notice::error(message).with_action("Sign In", "/signin")),
                    Effect::Settled,
                ]
            }
            FrameAction::OfferCheckout => {
                self.finalize(index, CHECKOUT_READY, false);
                vec![
                    Effect::Notify(
                        Notice::success("Ready to checkout!")
                            .with_action("Go to Payment", "/checkout"),
                    ),
                    Effect::Settled,
                ]
            }
            FrameAction::Complete => {
                self.finalize(index, COMPLETION_FALLBACK, false);
                vec![Effect::Settled]
            }
            FrameAction::Fail(reason) => {
                self.finalize(index, ERROR_REPLY, true);
                vec![Effect::Notify(Notice::error(reason)), Effect::Settled]
            }
            FrameAction::Skip(_) => Vec::new(),
        }
    }

    /// Abandon the open exchange. Text streamed so far is kept; an empty
    /// placeholder is removed. Earlier entries are never touched.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let Some(index) = self.placeholder_index() else {
            return Vec::new();
        };
        if self.messages[index].text().is_empty() {
            self.messages.remove(index);
        } else {
            self.messages[index].is_streaming = false;
        }
        self.placeholder = None;
        vec![Effect::Settled]
    }

    fn finalize(&mut self, index: usize, fallback: &str, replace: bool) {
        let message = &mut self.messages[index];
        if replace || message.text().trim().is_empty() {
            message.content = Some(fallback.to_string());
        }
        message.is_streaming = false;
        self.placeholder = None;
    }

    fn placeholder_index(&self) -> Option<usize> {
        let id = self.placeholder?;
        self.messages.iter().position(|m| m.id == id)
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::welcome()
    }
}

pub fn welcome_message() -> Message {
    Message::assistant(MessageId(1), WELCOME_MESSAGE)
}
