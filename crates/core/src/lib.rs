//! scosim-core: discrete-event simulation of SCO audio links
//!
//! This library drives automated tests of audio firmware without radio
//! hardware. It provides:
//! - A virtual-time scheduler with drift-corrected periodic timers
//! - Stream kinds (file, data, SCO link) sharing one lifecycle contract
//! - A registry mapping interface names to stream constructors
//! - A byte-accurate model of SCO link degradation (PER, BER, majority vote,
//!   never-scheduled bursts, Standard and Zeagle metadata)
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries:
//! - `bitio`: byte/bit and sample/byte conversions
//! - `buffer`: ring buffer used/free accounting
//! - `scheduler`: virtual clock, timer handles, drift correction
//! - `packetiser`: packet boundaries carried by audio sources
//! - `schema`: declarative key/value validation for stream configuration
//! - `transport`: virtual audio device endpoints
//! - `audio`: audio file collaborators (in-memory, WAV, raw PCM)
//! - `link`: SCO error model, metadata framing, packet injector
//! - `stream`: lifecycle state machine and stream kinds
//! - `factory`: interface registry
//! - `sim`: simulation context and event dispatch loop
//!
//! # Design Principles
//!
//! - **No panics**: configuration and resource problems are typed errors
//! - **Degrade, don't fail**: runtime data problems on a link are warnings
//! - **Deterministic**: seeded randomness and integer virtual time make runs
//!   reproducible
//! - **Single-threaded**: every event runs to completion, so no locking

pub mod audio;
pub mod bitio;
pub mod buffer;
pub mod error;
pub mod factory;
pub mod link;
pub mod packetiser;
pub mod scheduler;
pub mod schema;
pub mod sim;
pub mod stream;
pub mod transport;

/// One audio sample as exchanged with the virtual device.
pub type Sample = i32;

// Re-export commonly used types
pub use error::{Error, Result};
pub use factory::StreamFactory;
pub use sim::{Event, Notification, SimContext, Simulation};
pub use stream::{StreamId, StreamState, StreamType};
