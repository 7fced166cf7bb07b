//! Contract of the reflective object layer.
//!
//! The signal plane forwards fired values to remote peers through this trait;
//! it is the only surface of the reflection system the connection and routing
//! plane touches. Implementations live above this crate.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A remote callable object addressed by method id.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Invoke a method with encoded parameters and await the encoded result.
    async fn meta_call(&self, method: u32, params: Bytes) -> Result<Bytes>;

    /// Fire-and-forget invocation; delivery is best-effort.
    fn meta_post(&self, method: u32, params: Bytes);
}
