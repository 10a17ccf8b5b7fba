//! main.rs — synthetic miniSEED publisher
//!
//! Generates a continuous waveform per station/channel (sine carrier +
//! Gaussian noise, with optional Ricker-wavelet event bursts), chunks it
//! into miniSEED records, and publishes them onto the topic exchange with
//! routing key `NET.STA.LOC.CHA`. Event bursts arrive at each station with
//! a configurable moveout so the full detector → locator path lights up.

mod waveform;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::interval;
use tracing::{debug, info};

use seis_types::mseed;
use waveform::{ActiveEvent, CarrierState};

const CONTENT_TYPE: &str = "application/vnd.fdsn.mseed";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "seis-feeder", about = "Publish generated miniSEED to the bus")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 5672)]
    port: u16,
    #[arg(long, default_value = "guest")]
    user: String,
    #[arg(long, default_value = "guest")]
    password: String,
    #[arg(long, default_value = "/")]
    vhost: String,
    #[arg(long, default_value = "stations")]
    exchange: String,

    #[arg(long, default_value = "XX")]
    net: String,
    /// Station code. Repeatable for a small network.
    #[arg(long = "sta")]
    stas: Vec<String>,
    #[arg(long, default_value = "")]
    loc: String,
    /// Channel code. Repeatable (e.g. HHZ HHN HHE).
    #[arg(long = "chan")]
    chans: Vec<String>,

    #[arg(long = "samprate", default_value_t = 40.0)]
    sample_rate: f64,
    #[arg(long, default_value_t = 128)]
    chunk_samples: usize,
    /// Carrier amplitude (counts)
    #[arg(long, default_value_t = 500.0)]
    amplitude: f64,
    /// Carrier frequency (Hz)
    #[arg(long, default_value_t = 0.1)]
    carrier_hz: f64,
    /// Gaussian noise sigma (counts); 0 disables noise
    #[arg(long, default_value_t = 25.0)]
    noise_sigma: f64,

    /// Add Ricker wavelet bursts on top of the carrier
    #[arg(long)]
    event: bool,
    #[arg(long, default_value_t = 100.0)]
    event_duration: f64,
    #[arg(long, default_value_t = 0.5)]
    event_frequency: f64,
    #[arg(long, default_value_t = 2000.0)]
    event_amplitude: f64,
    /// Chance per chunk of starting a new burst
    #[arg(long, default_value_t = 0.05)]
    event_probability: f64,
    /// Arrival delay between consecutive stations (seconds)
    #[arg(long, default_value_t = 1.0)]
    event_moveout_seconds: f64,

    /// Number of chunks to publish; 0 means run until interrupted
    #[arg(long, default_value_t = 0)]
    count: u64,
    /// Publish as fast as possible instead of pacing to the sample rate
    #[arg(long)]
    burst: bool,
    #[arg(long, default_value = "INFO")]
    log_level: String,
}

impl Args {
    fn stations(&self) -> Vec<String> {
        if self.stas.is_empty() {
            vec!["TEST".to_string()]
        } else {
            self.stas.clone()
        }
    }

    fn channels(&self) -> Vec<String> {
        if self.chans.is_empty() {
            vec!["HHZ".to_string()]
        } else {
            self.chans.clone()
        }
    }

    fn amqp_url(&self) -> String {
        let vhost = self.vhost.replace('/', "%2f");
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat=30",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.sample_rate > 0.0, "--samprate must be > 0");
        anyhow::ensure!(self.chunk_samples > 0, "--chunk-samples must be > 0");
        anyhow::ensure!(self.amplitude > 0.0, "--amplitude must be > 0");
        anyhow::ensure!(
            self.channels().iter().all(|c| c.len() == 3),
            "--chan codes must be 3 characters"
        );
        if self.event {
            anyhow::ensure!(self.event_duration > 0.0, "--event-duration must be > 0");
            anyhow::ensure!(self.event_frequency > 0.0, "--event-frequency must be > 0");
            anyhow::ensure!(
                (0.0..=1.0).contains(&self.event_probability),
                "--event-probability must be between 0 and 1"
            );
        }
        Ok(())
    }
}

/// FDSN source identifier with the channel code split band/instrument/component.
fn build_sourceid(net: &str, sta: &str, loc: &str, chan: &str) -> String {
    let chars: Vec<char> = chan.chars().collect();
    format!(
        "FDSN:{net}_{sta}_{loc}_{}_{}_{}",
        chars[0], chars[1], chars[2]
    )
}

async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default().with_content_type(CONTENT_TYPE.to_string().into()),
        )
        .await?
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("seis_feeder={},lapin=warn", args.log_level.to_lowercase()).into()
            }),
        )
        .init();

    args.validate()?;
    let stations = args.stations();
    let channels = args.channels();

    let connection = Connection::connect(&args.amqp_url(), ConnectionProperties::default())
        .await
        .context("failed to connect to the message bus")?;
    let channel = connection.create_channel().await?;
    channel
        .exchange_declare(
            &args.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!(
        "📡 Feeding exchange='{}' stations={:?} channels={:?} samprate={} chunk={}",
        args.exchange, stations, channels, args.sample_rate, args.chunk_samples
    );

    let carrier = CarrierState::new(
        args.amplitude,
        args.carrier_hz,
        args.sample_rate,
        args.noise_sigma,
    );
    let mut rng = StdRng::from_entropy();

    let stream_start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    let chunk_period = Duration::from_secs_f64(args.chunk_samples as f64 / args.sample_rate);
    let mut ticker = interval(chunk_period);

    let mut sample_counter: u64 = 0;
    let mut chunk_counter: u64 = 0;
    let mut active_event: Option<ActiveEvent> = None;

    loop {
        if !args.burst {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping feeder");
                    break;
                }
            }
        }

        // Retire a finished burst, maybe start a new one.
        if let Some(event) = &active_event {
            if event.finished(sample_counter, stations.len()) {
                active_event = None;
            }
        }
        if args.event && active_event.is_none() && rng.gen_bool(args.event_probability) {
            let event = ActiveEvent {
                start_sample: sample_counter,
                total_samples: (args.event_duration * args.sample_rate) as u64,
                frequency: args.event_frequency,
                amplitude: args.event_amplitude,
                moveout_samples: (args.event_moveout_seconds * args.sample_rate) as u64,
            };
            info!(
                "💥 Event burst at sample {} ({}s, {} Hz)",
                event.start_sample, args.event_duration, args.event_frequency
            );
            active_event = Some(event);
        }

        let chunk_start_epoch = stream_start + sample_counter as f64 / args.sample_rate;

        for (station_idx, sta) in stations.iter().enumerate() {
            // One waveform per station, shared by its channels.
            let samples: Vec<f32> = (0..args.chunk_samples)
                .map(|i| {
                    let n = sample_counter + i as u64;
                    let mut v = carrier.sample(n, &mut rng);
                    if let Some(event) = &active_event {
                        v += event.sample(n, station_idx, args.sample_rate);
                    }
                    v as f32
                })
                .collect();

            for chan in &channels {
                let sid = build_sourceid(&args.net, sta, &args.loc, chan);
                let record = mseed::encode_f32(&sid, chunk_start_epoch, args.sample_rate, &samples)?;
                let routing_key = format!("{}.{}.{}.{}", args.net, sta, args.loc, chan);
                publish(&channel, &args.exchange, &routing_key, &record).await?;
                debug!(
                    "Published {} bytes for {routing_key} at {chunk_start_epoch:.3}",
                    record.len()
                );
            }
        }

        sample_counter += args.chunk_samples as u64;
        chunk_counter += 1;
        if chunk_counter % 50 == 0 {
            info!(
                "⏱ chunk={chunk_counter} samples={sample_counter} event_active={}",
                active_event.is_some()
            );
        }
        if args.count > 0 && chunk_counter >= args.count {
            info!("Published {chunk_counter} chunks, done");
            break;
        }
    }

    Ok(())
}
