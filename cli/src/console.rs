//! Terminal side of the collaborators, plus incremental rendering of the log.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::Mutex;

use storefront_core::{
    CartItem, CartSink, Message, MessageId, Navigator, Notice, NoticeAction, NoticeKind, Notifier,
    Role,
};

/// Prints cart additions and notices, and remembers the last offered action
/// so `/go` can follow it.
#[derive(Default)]
pub struct ConsoleHost {
    last_action: Mutex<Option<NoticeAction>>,
}

impl ConsoleHost {
    pub fn take_action(&self) -> Option<NoticeAction> {
        self.last_action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl CartSink for ConsoleHost {
    fn add(&self, item: &CartItem) {
        println!(
            "\n  [cart] +{} x {} ({:.2}, {})",
            item.quantity,
            item.name,
            item.price,
            item.image_or_placeholder()
        );
    }
}

impl Notifier for ConsoleHost {
    fn notify(&self, notice: &Notice) {
        let tag = match notice.kind {
            NoticeKind::Success => "ok",
            NoticeKind::Error => "error",
            NoticeKind::Info => "info",
        };
        match &notice.action {
            Some(action) => println!(
                "\n  [{tag}] {} ({}: type /go)",
                notice.message, action.label
            ),
            None => println!("\n  [{tag}] {}", notice.message),
        }
        if let Some(action) = &notice.action {
            *self.last_action.lock().unwrap_or_else(|e| e.into_inner()) = Some(action.clone());
        }
    }
}

impl Navigator for ConsoleHost {
    fn navigate(&self, path: &str) {
        println!("  -> opening {path}");
    }
}

/// Prints only what changed since the last call, so streamed replies appear
/// as they arrive.
#[derive(Default)]
pub struct Renderer {
    printed: HashMap<MessageId, String>,
    listed: HashSet<MessageId>,
}

impl Renderer {
    pub fn reset(&mut self) {
        self.printed.clear();
        self.listed.clear();
    }

    pub fn render(&mut self, messages: &[Message]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for message in messages {
            match message.role {
                Role::User => {
                    self.printed.insert(message.id, message.text().to_string());
                }
                Role::ProductList => {
                    if self.listed.insert(message.id) {
                        writeln!(out)?;
                        for product in &message.products {
                            writeln!(
                                out,
                                "  * {:<28} {:>9.2}  {}",
                                product.name, product.price, product.category
                            )?;
                        }
                    }
                }
                Role::Assistant => {
                    let text = message.text();
                    let printed = self.printed.entry(message.id).or_default();
                    if printed.is_empty() && !text.is_empty() {
                        write!(out, "\nassistant: {text}")?;
                    } else if let Some(rest) = text.strip_prefix(printed.as_str()) {
                        write!(out, "{rest}")?;
                    } else {
                        write!(out, "\nassistant: {text}")?;
                    }
                    *printed = text.to_string();
                }
            }
        }
        out.flush()
    }
}
