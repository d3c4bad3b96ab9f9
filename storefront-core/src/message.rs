use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

const DEFAULT_CATEGORY: &str = "Dessert";
const PLACEHOLDER_IMAGE: &str = "/placeholder.jpg";

/// Identifier of a log entry, monotonic within one conversation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ProductList,
}

impl Role {
    /// Roles whose entries carry text and take part in the request history
    pub fn is_content_bearing(self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

/// A catalog entry shown inline in the conversation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Product {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: f64,
    #[serde(default = "default_category", deserialize_with = "category_or_default")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A line the backend has put in the shopper's cart and the host cart should mirror.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CartItem {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: f64,
    #[serde(default = "default_category", deserialize_with = "category_or_default")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl CartItem {
    pub fn image_or_placeholder(&self) -> &str {
        self.image
            .as_deref()
            .filter(|i| !i.is_empty())
            .unwrap_or(PLACEHOLDER_IMAGE)
    }
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_quantity() -> u32 {
    1
}

fn category_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let category = Option::<String>::deserialize(deserializer)?;
    Ok(category
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(default_category))
}

// The backend serializes decimals as strings; older endpoints send plain numbers.
fn lenient_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// An entry in the conversation log.
///
/// `is_streaming` is transient: it is never serialized, so a restored
/// message is always settled.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub is_streaming: bool,
}

impl Message {
    fn new(id: MessageId, role: Role, content: Option<String>) -> Self {
        Message {
            id,
            role,
            content,
            products: Vec::new(),
            timestamp: Utc::now(),
            is_streaming: false,
        }
    }

    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Role::User, Some(text.into()))
    }

    pub fn assistant(id: MessageId, text: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, Some(text.into()))
    }

    /// An empty assistant message that deltas are streamed into
    pub fn placeholder(id: MessageId) -> Self {
        Message {
            is_streaming: true,
            ..Self::assistant(id, "")
        }
    }

    pub fn product_list(id: MessageId, products: Vec<Product>) -> Self {
        Message {
            products,
            ..Self::new(id, Role::ProductList, None)
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// One prior turn sent to the backend as context.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}
