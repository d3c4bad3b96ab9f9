//! Classification of decoded lines into conversation actions.

use serde_json::{Map, Value};
use tracing::debug;

use crate::decoder::{DONE_SENTINEL, Line, strip_data_prefix};
use crate::message::{CartItem, Product};

pub const DEFAULT_AUTH_PROMPT: &str = "Please sign in to continue";
const DEFAULT_FAILURE: &str = "The assistant sent a response it could not understand";

/// Frames the backend emits for transparency; they carry nothing for the log.
const INFORMATIONAL_TYPES: &[&str] = &["intent_detected", "faq_suggestions", "product_info"];

/// What one frame asks the conversation to do.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameAction {
    Complete,
    RequireAuth { message: String },
    OfferCheckout,
    ShowProducts(Vec<Product>),
    MutateCart(Vec<CartItem>),
    AppendDelta(String),
    Fail(String),
    /// Nothing to apply; reported to diagnostics only
    Skip(SkipReason),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    /// The payload is not valid JSON, or a known frame is missing its body
    Malformed { payload: String, error: String },
    /// A frame type that only carries backend diagnostics
    Informational { kind: String },
    /// Bytes left without a line delimiter when the stream ended
    Truncated { tail: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Malformed { payload, error } => {
                write!(f, "malformed frame ({error}): {payload}")
            }
            SkipReason::Informational { kind } => write!(f, "informational frame `{kind}`"),
            SkipReason::Truncated { tail } => write!(f, "undelimited tail dropped: {tail}"),
        }
    }
}

/// Interpret one decoded line.
pub fn interpret(line: &Line) -> FrameAction {
    let raw = match line {
        Line::Done => return FrameAction::Complete,
        Line::Data(raw) => raw,
    };
    let Some(body) = strip_data_prefix(raw) else {
        return malformed(raw, "missing data prefix");
    };
    if body == DONE_SENTINEL {
        return FrameAction::Complete;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => classify(body, &fields),
        Ok(other) => FrameAction::Fail(format!("Unexpected frame: {other}")),
        Err(e) => malformed(body, &e.to_string()),
    }
}

fn classify(body: &str, fields: &Map<String, Value>) -> FrameAction {
    match fields.get("type").and_then(Value::as_str) {
        Some("auth_required") => FrameAction::RequireAuth {
            message: non_empty_str(fields, "message")
                .unwrap_or(DEFAULT_AUTH_PROMPT)
                .to_string(),
        },
        Some("redirect_checkout") => FrameAction::OfferCheckout,
        Some("product_list") => {
            let products: Vec<Product> = list_field(fields, "products");
            if products.is_empty() {
                return malformed(body, "product_list without products");
            }
            FrameAction::ShowProducts(products)
        }
        Some("cart_update") => FrameAction::MutateCart(list_field(fields, "added_products")),
        Some("error") => FrameAction::Fail(failure_message(fields)),
        Some(kind) if INFORMATIONAL_TYPES.contains(&kind) => {
            FrameAction::Skip(SkipReason::Informational {
                kind: kind.to_string(),
            })
        }
        Some("content") | None => match fields.get("content") {
            Some(Value::String(delta)) => FrameAction::AppendDelta(delta.clone()),
            _ => FrameAction::Fail(failure_message(fields)),
        },
        Some(other) => FrameAction::Fail(format!("Unsupported frame type `{other}`")),
    }
}

fn malformed(payload: &str, error: &str) -> FrameAction {
    FrameAction::Skip(SkipReason::Malformed {
        payload: payload.to_string(),
        error: error.to_string(),
    })
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn failure_message(fields: &Map<String, Value>) -> String {
    non_empty_str(fields, "error")
        .or_else(|| non_empty_str(fields, "message"))
        .unwrap_or(DEFAULT_FAILURE)
        .to_string()
}

/// Deserialize each element of an array field on its own so one bad entry
/// does not drop the rest.
fn list_field<T: serde::de::DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> Vec<T> {
    let Some(Value::Array(items)) = fields.get(key) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(field = key, error = %e, "dropping unreadable list entry");
                None
            }
        })
        .collect()
}
