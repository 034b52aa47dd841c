//! Per-installation device identity.

use serde_json::Value;
use tracing::info;

use scoresync_common::{DeviceId, Error, Result};
use scoresync_store::{DurableStore, Table, WriteBatch};

const DEVICE_KEY: &str = "device_id";

/// Loads the installation's device id, creating it on first start.
pub struct DeviceIdentity;

impl DeviceIdentity {
    /// Read the stored id or persist a fresh one.
    ///
    /// Two contexts starting at once agree on a single id: the write only
    /// lands if the key is still absent, otherwise the winner's id is read.
    pub async fn load_or_create(store: &dyn DurableStore) -> Result<DeviceId> {
        loop {
            if let Some(value) = store.get(Table::Meta, DEVICE_KEY).await? {
                let id = value.as_str().ok_or_else(|| {
                    Error::Serialization(format!("stored device id is not a string: {}", value))
                })?;
                return DeviceId::new(id);
            }

            let candidate = DeviceId::generate();
            let batch = WriteBatch::new()
                .expect(Table::Meta, DEVICE_KEY, None)
                .put(
                    Table::Meta,
                    DEVICE_KEY,
                    Value::String(candidate.as_str().to_string()),
                );
            if store.apply(batch).await? {
                info!("Registered new device id {}", candidate);
                return Ok(candidate);
            }
        }
    }
}
