//! Document store collaborator.
//!
//! The rules engine never owns persistence. Characters, their items and their
//! progression bookkeeping are read and written through [`DocumentStore`].

use crate::advancement::ProgressionState;
use crate::character::{Character, CharacterDiff, CharacterId, ItemId, OwnedItem};
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Character not found: {0}")]
    CharacterNotFound(CharacterId),

    #[error("Item source not found: {0}")]
    SourceNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Invalid update path: {0}")]
    InvalidPath(String),

    #[error("Operation rejected: {0}")]
    Rejected(String),
}

/// CRUD access to characters and their owned items.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the current character record.
    async fn character(&self, id: CharacterId) -> Result<Character, StoreError>;

    /// Apply a partial update and return the character as stored afterwards.
    async fn update_character(
        &self,
        id: CharacterId,
        diff: &CharacterDiff,
    ) -> Result<Character, StoreError>;

    /// Create one owned item from a source uuid (e.g. a compendium entry).
    async fn create_item(&self, owner: CharacterId, source: &str) -> Result<OwnedItem, StoreError>;

    /// Delete owned items, returning the ids actually removed.
    async fn delete_items(
        &self,
        owner: CharacterId,
        ids: &[ItemId],
    ) -> Result<Vec<ItemId>, StoreError>;

    /// Fetch the advancement bookkeeping for a character.
    async fn progression(&self, id: CharacterId) -> Result<ProgressionState, StoreError>;

    async fn save_progression(
        &self,
        id: CharacterId,
        state: &ProgressionState,
    ) -> Result<(), StoreError>;
}
