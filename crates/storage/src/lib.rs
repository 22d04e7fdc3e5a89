pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod sqlite;

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tokio::sync::broadcast;

pub use error::{StorageError, StorageResult};
pub use feed::{ChangeFeed, ChangeKind, StoreChange};
pub use ids::{MessageId, ThreadId};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use error::{DeserializeValueSnafu, SerializeValueSnafu};

/// String-keyed, string-valued persistent store.
///
/// Writes are last-writer-wins; every successful write or removal is published on the
/// store's change feed so other holders of the same store can re-read the key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    fn keys(&self) -> StorageResult<Vec<String>>;
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// JSON (de)serialization on top of any [`KeyValueStore`].
pub trait JsonStoreExt: KeyValueStore {
    fn load_json<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw).context(DeserializeValueSnafu {
            stage: "load-json",
            key: key.to_string(),
        })?;
        Ok(Some(value))
    }

    fn save_json<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value).context(SerializeValueSnafu {
            stage: "save-json",
            key: key.to_string(),
        })?;
        self.set(key, &raw)
    }
}

impl<S> JsonStoreExt for S where S: KeyValueStore + ?Sized {}
