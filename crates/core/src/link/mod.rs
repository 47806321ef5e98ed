//! SCO link degradation model.
//!
//! - `error_model`: PER/BER on redundant copies and majority-vote recovery
//! - `metadata`: Standard and Zeagle packet headers
//! - `injector`: per-packet pipeline (never-scheduled bursts, error model,
//!   metadata, statistics) owned by a SCO source

pub mod error_model;
pub mod injector;
pub mod metadata;

pub use error_model::{majority_vote, ErrorModel, ErrorOutcome, Reception};
pub use injector::{LinkInjector, LinkStatistics};
pub use metadata::{MetadataFormat, StandardHeader, StandardStatus, ZeagleStatus};

/// Error injection parameters of one SCO link direction.
///
/// Percentages are in `[0, 100]`; the schema enforces that before a value of
/// this type is built.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkErrorConfig {
    /// PRNG seed; `None` draws one from entropy
    pub seed: Option<u64>,
    /// Redundant transmissions per packet
    pub packet_number: u32,
    /// Packet error rate (%)
    pub per: f64,
    /// Bit error rate (%)
    pub ber: f64,
    /// Probability (%) of starting a never-scheduled burst
    pub never_scheduled_error: f64,
    /// Length of a never-scheduled burst in packets
    pub never_scheduled_error_packets: u32,
    /// Zero-fill withheld or damaged data instead of omitting it
    pub data_error: bool,
    pub metadata_enable: bool,
    pub metadata_format: MetadataFormat,
}

impl Default for LinkErrorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            packet_number: 1,
            per: 0.0,
            ber: 0.0,
            never_scheduled_error: 0.0,
            never_scheduled_error_packets: 2,
            data_error: true,
            metadata_enable: false,
            metadata_format: MetadataFormat::Standard,
        }
    }
}
