//! Service directory records and machine identity.

use crate::codec;
use crate::error::Result;
use crate::url::Url;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

/// Immutable snapshot of a service as advertised by the directory.
///
/// `machine_id` is a process-group identity, stable per host: two peers with
/// equal machine ids share a loopback interface. The endpoint list may mix
/// loopback and routable addresses; consumers filter by locality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: u32,
    pub name: String,
    pub machine_id: String,
    pub process_id: u32,
    pub endpoints: Vec<Url>,
}

impl ServiceInfo {
    pub fn new(service_id: u32, name: &str, machine_id: &str, endpoints: Vec<Url>) -> Self {
        Self {
            service_id,
            name: name.to_string(),
            machine_id: machine_id.to_string(),
            process_id: std::process::id(),
            endpoints,
        }
    }

    /// Copy of this record with the endpoint list replaced (a forwarding node
    /// advertises itself in place of the backend).
    pub fn with_endpoints(&self, endpoints: Vec<Url>) -> Self {
        Self {
            endpoints,
            ..self.clone()
        }
    }

    /// Encode as a directory reply payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.service_id);
        codec::put_string(&mut buf, &self.name);
        codec::put_string(&mut buf, &self.machine_id);
        buf.put_u32_le(self.process_id);
        let endpoints: Vec<String> = self.endpoints.iter().map(|u| u.to_string()).collect();
        codec::put_string_vec(&mut buf, &endpoints);
        buf.freeze()
    }

    /// Decode a directory reply payload.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let service_id = codec::get_u32(buf)?;
        let name = codec::get_string(buf)?;
        let machine_id = codec::get_string(buf)?;
        let process_id = codec::get_u32(buf)?;
        let endpoints = codec::get_string_vec(buf)?
            .iter()
            .map(|s| Url::parse(s))
            .collect();
        Ok(Self {
            service_id,
            name,
            machine_id,
            process_id,
            endpoints,
        })
    }
}

static MACHINE_ID: OnceLock<String> = OnceLock::new();

/// Stable identifier of this host's process group.
///
/// Computed once per process and cached: callers key connection state by it,
/// so it must not change across the cache's lifetime.
pub fn local_machine_id() -> &'static str {
    MACHINE_ID.get_or_init(|| {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let id = contents.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.is_empty() {
                return hostname;
            }
        }
        warn!("no machine id source available, using fallback identity");
        "unknown-machine".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_info_round_trip() {
        let info = ServiceInfo::new(
            42,
            "ALMotion",
            "0279a027-8cbf-4e27-a1a1-3e94be3d5f85",
            vec![
                Url::parse("tcp://10.0.252.216:9559"),
                Url::parse("tcp://127.0.0.1:9559"),
            ],
        );
        let mut encoded = info.encode();
        let decoded = ServiceInfo::decode(&mut encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_decode_truncated_record() {
        let info = ServiceInfo::new(1, "directory", "machine", vec![]);
        let encoded = info.encode();
        let mut short = encoded.slice(..encoded.len() - 3);
        assert!(ServiceInfo::decode(&mut short).is_err());
    }

    #[test]
    fn test_with_endpoints_replaces_only_endpoints() {
        let info = ServiceInfo::new(42, "svc", "machine", vec![Url::parse("tcp://1.2.3.4:1")]);
        let rewritten = info.with_endpoints(vec![Url::parse("tcp://gateway:9000")]);
        assert_eq!(rewritten.service_id, info.service_id);
        assert_eq!(rewritten.machine_id, info.machine_id);
        assert_eq!(rewritten.endpoints.len(), 1);
        assert_eq!(rewritten.endpoints[0].host(), "gateway");
    }

    #[test]
    fn test_local_machine_id_is_stable() {
        assert_eq!(local_machine_id(), local_machine_id());
        assert!(!local_machine_id().is_empty());
    }
}
