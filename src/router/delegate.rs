//! The accessory object-graph collaborator
//!
//! The engine owns transport and pairing; the accessory tree itself —
//! services, characteristics, snapshots — lives behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::HapStatus;

/// One characteristic to read
#[derive(Debug, Clone)]
pub struct CharacteristicRead {
    /// Accessory instance id
    pub aid: u64,
    /// Characteristic instance id
    pub iid: u64,
    /// Include metadata (format, unit, range) in the result
    pub include_meta: bool,
    /// Include permissions in the result
    pub include_perms: bool,
    /// Include the characteristic type in the result
    pub include_type: bool,
    /// Include notification state in the result
    pub include_ev: bool,
}

/// Result of one characteristic read
#[derive(Debug, Clone, Serialize)]
pub struct CharacteristicReadResult {
    /// Accessory instance id
    pub aid: u64,
    /// Characteristic instance id
    pub iid: u64,
    /// The value, when the read succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Read outcome; filled into the body by the multi-status rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HapStatus>,
    /// Characteristic type, when requested
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub characteristic_type: Option<String>,
    /// Metadata object flattened into the entry, when requested
    #[serde(flatten)]
    pub meta: Option<Value>,
}

/// One characteristic write
#[derive(Debug, Clone, Deserialize)]
pub struct CharacteristicWrite {
    /// Accessory instance id
    pub aid: u64,
    /// Characteristic instance id
    pub iid: u64,
    /// New value, absent for subscription-only entries
    #[serde(default)]
    pub value: Option<Value>,
    /// Subscription change, if any
    #[serde(default)]
    pub ev: Option<bool>,
    /// Authorization data supplied by the controller
    #[serde(default, rename = "authData")]
    pub auth_data: Option<String>,
    /// Remote write (from a home hub)
    #[serde(default)]
    pub remote: Option<bool>,
    /// Controller expects a write-response value
    #[serde(default, rename = "r")]
    pub write_response: Option<bool>,
}

/// Result of one characteristic write
#[derive(Debug, Clone)]
pub struct CharacteristicWriteResult {
    /// Accessory instance id
    pub aid: u64,
    /// Characteristic instance id
    pub iid: u64,
    /// Write outcome
    pub status: HapStatus,
    /// Write-response value, when the characteristic produces one
    pub value: Option<Value>,
}

/// A `/resource` request (camera snapshot fetch)
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceRequest {
    /// Resource kind, e.g. `image`
    #[serde(rename = "resource-type")]
    pub resource_type: String,
    /// Requested image width
    #[serde(default, rename = "image-width")]
    pub image_width: Option<u32>,
    /// Requested image height
    #[serde(default, rename = "image-height")]
    pub image_height: Option<u32>,
    /// Target accessory, for bridges
    #[serde(default)]
    pub aid: Option<u64>,
}

/// Bytes answering a `/resource` request
#[derive(Debug, Clone)]
pub struct ResourceResponse {
    /// Payload bytes
    pub body: Vec<u8>,
    /// Content type, e.g. `image/jpeg`
    pub content_type: String,
}

/// The accessory/service/characteristic object graph consumed by the
/// router. Implementations live outside this crate's scope.
#[async_trait]
pub trait AccessoryDelegate: Send + Sync {
    /// The full accessory attribute database as HAP JSON
    /// (`{"accessories": [...]}`).
    async fn accessories(&self) -> Result<Value, HapStatus>;

    /// Read a batch of characteristics; one result per request, same
    /// order.
    async fn read_characteristics(
        &self,
        reads: Vec<CharacteristicRead>,
    ) -> Vec<CharacteristicReadResult>;

    /// Write a batch of characteristics; one result per write, same
    /// order. Entries that only change subscriptions are not passed here.
    async fn write_characteristics(
        &self,
        writes: Vec<CharacteristicWrite>,
    ) -> Vec<CharacteristicWriteResult>;

    /// Run the accessory's identify routine
    async fn identify(&self) -> Result<(), HapStatus>;

    /// Produce a resource (e.g. camera snapshot)
    async fn resource(&self, request: ResourceRequest) -> Result<ResourceResponse, HapStatus>;
}
