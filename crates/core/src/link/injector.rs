//! Per-packet link pipeline of a SCO source.
//!
//! Every outgoing packet passes through [`LinkInjector::generate_packet`]:
//!
//! 1. Samples are packed to bytes (16-bit little-endian or 8-bit)
//! 2. A never-scheduled burst may withhold the packet
//! 3. Otherwise the error model applies PER/BER and majority vote
//! 4. Metadata is added when enabled
//! 5. Bytes are unpacked back to the stream's sample width
//!
//! The injector also keeps the link statistics and the simulated Bluetooth
//! clock carried in Standard headers.

use super::error_model::{ErrorModel, Reception};
use super::metadata::{encode_standard, encode_zeagle, MetadataFormat, StandardStatus, ZeagleStatus};
use super::LinkErrorConfig;
use crate::{bitio, Sample};
use serde::Serialize;
use tracing::{debug, warn};

/// Counters of one streaming session. Reset on every start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatistics {
    /// Packets that produced output on the link
    pub sent_packets: u64,
    /// Redundant copies lost to PER
    pub sent_per: u64,
    /// Bit positions damaged by BER
    pub sent_ber: u64,
    /// Packets received with bit errors
    pub sent_crc_error: u64,
    /// Packets with every copy lost
    pub sent_nothing_received_error: u64,
    /// Never-scheduled bursts started
    pub sent_never_scheduled_error: u64,
}

/// Error injection state owned by one SCO source.
#[derive(Debug, Clone)]
pub struct LinkInjector {
    config: LinkErrorConfig,
    model: ErrorModel,
    tesco: u16,
    bt_clock: u16,
    never_scheduled_cnt: u32,
    withheld: Vec<u8>,
    stats: LinkStatistics,
}

impl LinkInjector {
    /// Create an injector for a link scheduled every `tesco` slots.
    pub fn new(config: LinkErrorConfig, tesco: u16) -> Self {
        let model = ErrorModel::new(config.seed);
        Self {
            config,
            model,
            tesco,
            bt_clock: 0,
            never_scheduled_cnt: 0,
            withheld: Vec::new(),
            stats: LinkStatistics::default(),
        }
    }

    pub fn config(&self) -> &LinkErrorConfig {
        &self.config
    }

    /// Seed in use, including one drawn from entropy.
    pub fn seed(&self) -> u64 {
        self.model.seed()
    }

    pub fn statistics(&self) -> LinkStatistics {
        self.stats
    }

    pub fn bt_clock(&self) -> u16 {
        self.bt_clock
    }

    /// Start a new session: clear statistics and any burst in progress.
    ///
    /// The PRNG and the Bluetooth clock keep running across sessions.
    pub fn reset(&mut self) {
        self.stats = LinkStatistics::default();
        self.never_scheduled_cnt = 0;
        self.withheld.clear();
    }

    /// Turn one chunk of audio into what the receiver sees.
    ///
    /// # Returns
    /// Samples to write to the link. Empty while a never-scheduled burst
    /// withholds data.
    pub fn generate_packet(&mut self, samples: &[Sample], sample_width: u32) -> Vec<Sample> {
        let data = if sample_width == 16 {
            bitio::samples_to_bytes(samples)
        } else {
            bitio::samples_to_octets(samples)
        };

        let out = self.generate_bytes(&data);
        self.bt_clock = self.bt_clock.wrapping_add(self.tesco.wrapping_mul(2));

        if !out.is_empty() {
            self.stats.sent_packets += 1;
        }
        if sample_width == 16 {
            bitio::bytes_to_samples(&out)
        } else {
            bitio::octets_to_samples(&out)
        }
    }

    fn generate_bytes(&mut self, data: &[u8]) -> Vec<u8> {
        let never_val = self.model.draw_percent();

        if self.never_scheduled_cnt > 0 {
            self.never_scheduled_cnt += 1;
            if self.never_scheduled_cnt >= self.config.never_scheduled_error_packets {
                self.withheld.extend_from_slice(data);
                let payload = std::mem::take(&mut self.withheld);
                self.never_scheduled_cnt = 0;
                return if self.config.metadata_enable {
                    encode_standard(&payload, StandardStatus::NeverScheduled, self.bt_clock)
                } else {
                    payload
                };
            }

            warn!("sco data skipping packet as we are in never scheduled mode");
            self.withhold(data.len());
            return Vec::new();
        }

        if never_val < self.config.never_scheduled_error {
            warn!("sco data inserting never scheduled error");
            self.never_scheduled_cnt = 1;
            self.stats.sent_never_scheduled_error += 1;
            self.withheld.clear();
            self.withhold(data.len());
            return Vec::new();
        }

        let outcome = self.model.insert_error(
            data,
            self.config.packet_number,
            self.config.per,
            self.config.ber,
        );
        self.stats.sent_per += u64::from(self.config.packet_number) - outcome.survivors() as u64;
        self.stats.sent_ber += outcome.error_bits() as u64;

        let reception = outcome.reception();
        match reception {
            Reception::Ok => {}
            Reception::CrcError => self.stats.sent_crc_error += 1,
            Reception::NothingReceived => self.stats.sent_nothing_received_error += 1,
        }
        debug!(
            survivors = outcome.survivors(),
            error_bits = outcome.error_bits(),
            ?reception,
            "sco packet"
        );

        if !self.config.metadata_enable {
            return outcome.data;
        }

        match self.config.metadata_format {
            MetadataFormat::Standard => {
                let status = match reception {
                    Reception::Ok => StandardStatus::Ok,
                    Reception::CrcError => StandardStatus::CrcError,
                    Reception::NothingReceived => StandardStatus::NothingReceived,
                };
                let payload = if status != StandardStatus::Ok && !self.config.data_error {
                    &[][..]
                } else {
                    &outcome.data[..]
                };
                encode_standard(payload, status, self.bt_clock)
            }
            MetadataFormat::Zeagle => {
                let status = ZeagleStatus::classify(outcome.survivors(), outcome.has_bit_errors());
                encode_zeagle(&outcome.data, status, &outcome.bit_error, self.bt_clock)
            }
        }
    }

    fn withhold(&mut self, len: usize) {
        if self.config.data_error {
            self.withheld.resize(self.withheld.len() + len, 0);
        }
    }
}
