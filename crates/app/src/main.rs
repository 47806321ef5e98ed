//! scosim - stream audio over a simulated SCO link.
//!
//! Plays a generated tone (or a WAV/raw file) from a SCO source, loops it
//! back through an in-memory device to a SCO sink, and reports the link
//! statistics and what arrived.

mod config;
mod input_gen;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, Scenario};
use scosim_core::schema::{config_map, ConfigMap};
use scosim_core::transport::{sco_to_air, LoopbackDevice};
use scosim_core::{Notification, Simulation, StreamId, StreamType};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_TAG: u32 = 100;
const LINK_BUFFER_WORDS: usize = 4096;
const GENERATED_CLIP: &str = "generated";
/// Virtual time per run step, in seconds.
const STEP: f64 = 0.1;
/// Virtual time the sink keeps running after the source finished.
const DRAIN: f64 = 0.05;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scosim=info,scosim_core=warn")),
        )
        .init();

    let scenario = Scenario::from_args(Args::parse());
    if scenario.print_config {
        println!("{}", serde_json::to_string_pretty(&scenario)?);
    }
    scenario.print();

    let report = run(&scenario)?;
    report.print();
    Ok(())
}

/// Outcome of one run.
#[derive(Debug)]
struct Report {
    stats: scosim_core::link::LinkStatistics,
    received_samples: usize,
    received_packets: usize,
    virtual_secs: f64,
}

impl Report {
    fn print(&self) {
        println!("=== Results ===");
        println!("Virtual time: {:.3} s", self.virtual_secs);
        println!("Packets sent: {}", self.stats.sent_packets);
        println!("  copies lost (PER): {}", self.stats.sent_per);
        println!("  bits flipped (BER): {}", self.stats.sent_ber);
        println!("  CRC errors: {}", self.stats.sent_crc_error);
        println!("  nothing received: {}", self.stats.sent_nothing_received_error);
        println!("  never scheduled bursts: {}", self.stats.sent_never_scheduled_error);
        println!(
            "Received: {} samples in {} packets",
            self.received_samples, self.received_packets
        );
    }
}

fn source_params(scenario: &Scenario, filename: &str) -> ConfigMap {
    let mut params = config_map(json!({
        "backing": "file",
        "filename": filename,
        "loop": scenario.loops,
        "seed": scenario.seed,
        "per": scenario.per,
        "ber": scenario.ber,
        "packet_number": scenario.packet_number,
        "never_scheduled_error": scenario.never_scheduled_error,
        "never_scheduled_error_packets": scenario.never_scheduled_error_packets,
        "metadata_enable": scenario.metadata_enable,
        "metadata_format": scenario.metadata_format,
        "tesco": scenario.tesco,
        "service_tag": SERVICE_TAG,
        "wallclock_accuracy": scenario.wallclock_accuracy,
    }));
    let raw_input = scenario
        .input
        .as_ref()
        .is_some_and(|p| !p.extension().is_some_and(|e| e.eq_ignore_ascii_case("wav")));
    if raw_input {
        // raw files carry no format of their own
        params.insert("sample_rate".into(), json!(scenario.sample_rate));
        params.insert("sample_width".into(), json!(scenario.sample_width));
    }
    params
}

/// Sink side: a SCO sink on the same link, or a plain tap on the to-air
/// endpoint when the SCO sink could not parse what the source sends.
fn sink(sim: &mut Simulation, scenario: &Scenario, source: StreamId, rate: f64, width: u32) -> Result<StreamId> {
    let id = if scenario.raw_tap() {
        sim.get_instance(
            "data",
            StreamType::Sink,
            &config_map(json!({
                "endpoint": sco_to_air(SERVICE_TAG),
                "sample_rate": rate,
                "sample_width": width,
            })),
        )?
    } else {
        let mut params = config_map(json!({
            "backing": "data",
            "sample_rate": rate,
            "sample_width": width,
            "stream": source,
            "metadata_enable": scenario.metadata_enable,
            "wallclock_accuracy": scenario.wallclock_accuracy,
        }));
        if let Some(output) = &scenario.output {
            params.insert("backing".into(), json!("file"));
            params.insert("filename".into(), json!(output.to_string_lossy()));
        }
        sim.get_instance("sco", StreamType::Sink, &params)?
    };
    Ok(id)
}

fn run(scenario: &Scenario) -> Result<Report> {
    let mut sim = Simulation::new(LoopbackDevice::new().with_sco_link(SERVICE_TAG, LINK_BUFFER_WORDS));

    let filename = match &scenario.input {
        Some(path) => path.to_string_lossy().into_owned(),
        None => {
            sim.add_clip(
                GENERATED_CLIP,
                input_gen::generate_clip(
                    scenario.seed,
                    scenario.sample_rate,
                    scenario.sample_width,
                    scenario.duration,
                    scenario.packetised,
                ),
            );
            GENERATED_CLIP.to_string()
        }
    };

    let source = sim
        .get_instance("sco", StreamType::Source, &source_params(scenario, &filename))
        .context("invalid source configuration")?;
    let sink = sink(&mut sim, scenario, source, scenario.sample_rate, scenario.sample_width)
        .context("invalid sink configuration")?;

    for id in [source, sink] {
        sim.create(id)?;
        sim.config(id, &ConfigMap::new())?;
    }
    sim.start(source)?;
    sim.start(sink)?;

    // Stop once the source is done, or after twice the expected play time
    let limit = 2.0 * scenario.duration.max(STEP) * f64::from(scenario.loops) + 1.0;
    let mut received_samples = 0;
    let mut received_packets = 0;
    let mut finished = false;
    while !finished && sim.now() < limit {
        sim.run_for(STEP)?;
        for note in sim.take_notifications() {
            match note {
                Notification::EndOfFile { stream } if stream == source => finished = true,
                Notification::Data { data, .. } => {
                    received_samples += data.len();
                    received_packets += 1;
                }
                Notification::EndOfFile { .. } => {}
            }
        }
    }
    if !finished {
        warn!(limit, "source did not finish in time");
    }

    sim.run_for(DRAIN)?;
    for note in sim.take_notifications() {
        if let Notification::Data { data, .. } = note {
            received_samples += data.len();
            received_packets += 1;
        }
    }

    let stats = sim.statistics(source).unwrap_or_default();
    for id in [sink, source] {
        sim.stop(id)?;
        sim.destroy(id)?;
        sim.put_instance(id)?;
    }
    if let Some(output) = &scenario.output {
        info!(path = %output.display(), "received audio written");
    }

    Ok(Report {
        stats,
        received_samples,
        received_packets,
        virtual_secs: sim.now(),
    })
}
