//! Registry of stream kinds.
//!
//! Kinds are registered explicitly at startup, keyed by interface name. The
//! first registrant of an interface wins; a duplicate is refused and
//! reported. Platform support is advisory only.

use crate::error::{ResourceError, Result};
use crate::schema::ConfigMap;
use crate::sim::SimContext;
use crate::stream::{data, file, sco, Stream, StreamId, StreamType};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Builds one stream instance from its construction-time configuration.
pub type Constructor =
    fn(StreamId, StreamType, &ConfigMap, &SimContext) -> Result<Box<dyn Stream>>;

/// Static description of a stream kind.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub interface: &'static str,
    /// Platforms known to work; empty means any
    pub platforms: &'static [&'static str],
    pub stream_types: &'static [StreamType],
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub descriptor: StreamDescriptor,
    pub constructor: Constructor,
}

const BOTH: &[StreamType] = &[StreamType::Source, StreamType::Sink];

/// Interface name to registration map.
#[derive(Debug, Clone, Default)]
pub struct StreamFactory {
    registry: BTreeMap<&'static str, Registration>,
    platform: Option<String>,
}

impl StreamFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the `file`, `data` and `sco` kinds.
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        let builtin: [(StreamDescriptor, Constructor); 3] = [
            (
                StreamDescriptor {
                    interface: file::INTERFACE,
                    platforms: &[],
                    stream_types: BOTH,
                },
                file::FileStream::construct,
            ),
            (
                StreamDescriptor {
                    interface: data::INTERFACE,
                    platforms: &[],
                    stream_types: BOTH,
                },
                data::DataStream::construct,
            ),
            (
                StreamDescriptor {
                    interface: sco::INTERFACE,
                    platforms: sco::PLATFORMS,
                    stream_types: BOTH,
                },
                sco::ScoStream::construct,
            ),
        ];
        for (descriptor, constructor) in builtin {
            // names are distinct, so this cannot collide
            let _ = factory.register(descriptor, constructor);
        }
        factory
    }

    /// Platform the simulated device claims to be.
    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = Some(platform.to_string());
        self
    }

    /// Register a stream kind.
    ///
    /// # Errors
    /// `DuplicateInterface` if the interface is taken; the existing
    /// registration stays in place.
    pub fn register(&mut self, descriptor: StreamDescriptor, constructor: Constructor) -> Result<()> {
        let interface = descriptor.interface;
        if self.registry.contains_key(interface) {
            warn!(interface, "interface already registered, keeping the first");
            return Err(ResourceError::DuplicateInterface(interface.to_string()).into());
        }
        debug!(interface, "stream kind registered");
        self.registry.insert(
            interface,
            Registration {
                descriptor,
                constructor,
            },
        );
        Ok(())
    }

    pub fn get_class(&self, interface: &str) -> Result<&Registration> {
        self.registry
            .get(interface)
            .ok_or_else(|| ResourceError::UnknownInterface(interface.to_string()).into())
    }

    /// Registered interface names, sorted.
    pub fn interfaces(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registry.keys().copied()
    }

    /// Construct an instance of `interface`.
    pub fn instantiate(
        &self,
        interface: &str,
        stream_type: StreamType,
        id: StreamId,
        params: &ConfigMap,
        ctx: &SimContext,
    ) -> Result<Box<dyn Stream>> {
        let registration = self.get_class(interface)?;
        let descriptor = &registration.descriptor;

        if !descriptor.stream_types.contains(&stream_type) {
            return Err(ResourceError::UnsupportedStreamType {
                interface: interface.to_string(),
                stream_type,
            }
            .into());
        }
        if let Some(platform) = &self.platform {
            if !descriptor.platforms.is_empty() && !descriptor.platforms.contains(&platform.as_str()) {
                warn!(interface, platform = %platform, "stream not known to work on this platform");
            }
        }

        (registration.constructor)(id, stream_type, params, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::schema::config_map;
    use crate::transport::LoopbackDevice;
    use serde_json::json;

    fn sink_only(
        id: StreamId,
        stream_type: StreamType,
        params: &ConfigMap,
        ctx: &SimContext,
    ) -> Result<Box<dyn Stream>> {
        data::DataStream::construct(id, stream_type, params, ctx)
    }

    #[test]
    fn test_builtin_interfaces() {
        let factory = StreamFactory::with_builtin();
        assert_eq!(factory.interfaces().collect::<Vec<_>>(), vec!["data", "file", "sco"]);
        assert_eq!(factory.get_class("sco").unwrap().descriptor.platforms, sco::PLATFORMS);
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let mut factory = StreamFactory::with_builtin();
        let err = factory
            .register(
                StreamDescriptor {
                    interface: "sco",
                    platforms: &[],
                    stream_types: &[StreamType::Sink],
                },
                sink_only,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Resource(ResourceError::DuplicateInterface(ref i)) if i == "sco"));
        assert_eq!(factory.get_class("sco").unwrap().descriptor.stream_types, BOTH);
    }

    #[test]
    fn test_unsupported_stream_type() {
        let mut factory = StreamFactory::new();
        factory
            .register(
                StreamDescriptor {
                    interface: "capture",
                    platforms: &[],
                    stream_types: &[StreamType::Sink],
                },
                sink_only,
            )
            .unwrap();

        let ctx = SimContext::new(LoopbackDevice::new().with_endpoint("pcm", 16));
        let params = config_map(json!({"endpoint": "pcm", "sample_width": 16}));
        let err = factory
            .instantiate("capture", StreamType::Source, StreamId(0), &params, &ctx)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Resource(ResourceError::UnsupportedStreamType { .. })));
    }

    #[test]
    fn test_platform_mismatch_is_advisory() {
        let factory = StreamFactory::with_builtin().with_platform("desktop");
        let mut ctx = SimContext::new(LoopbackDevice::new());
        ctx.add_clip(
            "speech",
            crate::audio::AudioClip::mono(8000.0, 16, vec![0; 30]),
        );
        let params = config_map(json!({"backing": "file", "filename": "speech"}));
        assert!(factory
            .instantiate("sco", StreamType::Source, StreamId(0), &params, &ctx)
            .is_ok());
    }
}
