//! Card membership service.
//!
//! Request `{action: "check"|"add", uid}`; one JSON reply per request. The set
//! lives in memory for the lifetime of the registry.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::RwLock;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Authorized,
    Unauthorized,
    Added,
    Exists,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CardResponse {
    pub status: CardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CardResponse {
    fn for_uid(status: CardStatus, uid: &str) -> Self {
        Self {
            status,
            uid: Some(uid.to_string()),
            message: None,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            status: CardStatus::Error,
            uid: None,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Default)]
pub struct CardRegistry {
    cards: RwLock<HashSet<String>>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, uid: &str) -> bool {
        self.cards.read().await.contains(uid)
    }

    /// Returns false when the card was already present.
    pub async fn add(&self, uid: &str) -> bool {
        self.cards.write().await.insert(uid.to_string())
    }

    pub async fn len(&self) -> usize {
        self.cards.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cards.read().await.is_empty()
    }

    /// Handle one raw request frame.
    pub async fn handle_message(&self, raw: &[u8]) -> CardResponse {
        let request: serde_json::Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(_) => return CardResponse::error("Invalid JSON"),
        };

        let uid = match request.get("uid").and_then(|u| u.as_str()) {
            Some(uid) if !uid.is_empty() => uid,
            _ => return CardResponse::error("No UID provided"),
        };

        match request.get("action").and_then(|a| a.as_str()) {
            Some("check") => {
                if self.contains(uid).await {
                    tracing::info!("Card {} authorized", uid);
                    CardResponse::for_uid(CardStatus::Authorized, uid)
                } else {
                    tracing::info!("Card {} unauthorized", uid);
                    CardResponse::for_uid(CardStatus::Unauthorized, uid)
                }
            }
            Some("add") => {
                if self.add(uid).await {
                    tracing::info!("Card {} added to database", uid);
                    CardResponse::for_uid(CardStatus::Added, uid)
                } else {
                    tracing::info!("Card {} already exists in database", uid);
                    CardResponse {
                        message: Some("Card already exists".to_string()),
                        ..CardResponse::for_uid(CardStatus::Exists, uid)
                    }
                }
            }
            _ => CardResponse::error("Unknown action"),
        }
    }
}
