//! Room capability registry

use crate::engine::{MediaEngine, RtpCapabilities};
use crate::error::{Error, Result};

/// The router's negotiated RTP capabilities, fixed at start-up
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    capabilities: RtpCapabilities,
}

impl CapabilityRegistry {
    /// Read the capabilities from an initialized engine
    ///
    /// An engine that advertises no codecs cannot serve any session, so this
    /// is a configuration failure rather than a per-request error.
    pub fn load(engine: &dyn MediaEngine) -> Result<Self> {
        let capabilities = engine.rtp_capabilities();

        let has_codecs = capabilities
            .as_value()
            .get("codecs")
            .and_then(|c| c.as_array())
            .map_or(false, |codecs| !codecs.is_empty());
        if !has_codecs {
            return Err(Error::Config(
                "media engine router advertises no codecs".into(),
            ));
        }

        Ok(Self { capabilities })
    }

    pub fn get(&self) -> &RtpCapabilities {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::InMemoryEngine;

    #[test]
    fn test_load_from_engine() {
        let engine = InMemoryEngine::new();
        let registry = CapabilityRegistry::load(&engine).unwrap();

        let codecs = registry.get().as_value()["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 2);
        assert_eq!(registry.get(), &engine.rtp_capabilities());
    }

    #[test]
    fn test_router_without_codecs_is_fatal() {
        let engine = InMemoryEngine::with_capabilities(RtpCapabilities(json!({"codecs": []})));
        let err = CapabilityRegistry::load(&engine).unwrap_err();
        assert!(err.is_fatal());
    }
}
