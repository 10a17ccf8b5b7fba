//! # consumer
//!
//! Bus consumer loop: decode → buffer → schedule → detect → dedup → persist.
//!
//! One blocking consume stream delivers one message at a time; the handler
//! runs to completion before the next delivery is taken. Acks happen after
//! successful processing, undecodable messages are nacked without requeue
//! (poison drop), and per-key detector state stays single-writer because
//! this loop is the only task touching it.
//!
//! Transient bus failures are not retried here — the error surfaces and the
//! service restarts clean, per the degradation policy.

use anyhow::Context;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use seis_types::mseed::{self, DecodedSegment};
use seis_types::SourceId;

use crate::buffer::RollingTraceBuffer;
use crate::dedup::filter_picks;
use crate::picker::{filter_classifier_output, PhasePicker};
use crate::scheduler::{Backend, DetectScheduler, StaLtaParams};
use crate::settings::Settings;
use crate::store::PickStore;
use crate::trigger::detect_sta_lta;
use crate::window::build_multichannel_window;

/// Everything the handler mutates. Owned by the consumer loop alone.
pub struct DetectorState {
    pub buffer: RollingTraceBuffer,
    pub scheduler: DetectScheduler,
    pub backend: Backend,
}

impl DetectorState {
    pub fn new(buffer_seconds: f64, backend: Backend) -> Self {
        Self {
            buffer: RollingTraceBuffer::new(buffer_seconds),
            scheduler: DetectScheduler::new(),
            backend,
        }
    }
}

async fn configure_channel(channel: &Channel, settings: &Settings) -> anyhow::Result<String> {
    channel
        .basic_qos(settings.prefetch, BasicQosOptions::default())
        .await?;

    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let exclusive = settings.queue.is_empty();
    let queue = channel
        .queue_declare(
            &settings.queue,
            QueueDeclareOptions {
                durable: !exclusive,
                exclusive,
                auto_delete: exclusive,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    let queue_name = queue.name().as_str().to_string();

    for key in settings.binding_keys() {
        channel
            .queue_bind(
                &queue_name,
                &settings.exchange,
                &key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(queue_name)
}

/// Run the consumer until shutdown is signalled or the bus drops.
pub async fn run_consumer(
    settings: &Settings,
    store: &PickStore,
    mut state: DetectorState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let connection = Connection::connect(&settings.amqp_url(), ConnectionProperties::default())
        .await
        .context("failed to connect to the message bus")?;
    let channel = connection.create_channel().await?;
    let queue_name = configure_channel(&channel, settings).await?;

    let mut consumer = channel
        .basic_consume(
            &queue_name,
            "seis-detector",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        "Consuming from exchange='{}' queue='{}' bindings={:?} prefetch={}",
        settings.exchange,
        queue_name,
        settings.binding_keys(),
        settings.prefetch
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Shutdown signalled, stopping consumer");
                    return Ok(());
                }
            }
            delivery = consumer.next() => {
                let delivery = delivery
                    .context("bus stream closed")?
                    .context("bus delivery failed")?;
                let routing_key = delivery.routing_key.as_str().to_string();

                match mseed::decode(&delivery.data) {
                    Err(e) => {
                        warn!("Failed to decode miniSEED from routing key {routing_key}: {e}");
                        if let Err(e) = delivery
                            .nack(BasicNackOptions { requeue: false, ..Default::default() })
                            .await
                        {
                            warn!("Nack failed for {routing_key}: {e}");
                        }
                    }
                    Ok(segments) => {
                        for segment in &segments {
                            process_segment(segment, &mut state, settings, store).await;
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!("Ack failed for {routing_key}: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Handle one decoded segment: append to the rolling buffer and, when the
/// key is ready and off cooldown, run the configured detector.
pub async fn process_segment(
    segment: &DecodedSegment,
    state: &mut DetectorState,
    settings: &Settings,
    store: &PickStore,
) {
    if segment.samples.is_empty() {
        warn!("No samples for {} segment; skipping", segment.sid);
        return;
    }
    if let Err(e) = state
        .buffer
        .add_segment(&segment.sid, segment.start, segment.samprate, &segment.samples)
    {
        warn!("Rejected segment for {}: {e}", segment.sid);
        return;
    }
    let buffered = state.buffer.buffered_seconds(&segment.sid);
    debug!("Buffered {}: {:.2}s", segment.sid, buffered);

    match &state.backend {
        Backend::StaLta(params) => {
            if buffered < settings.buffer_seconds {
                return;
            }
            run_sta_lta(&segment.sid, params.clone(), state, settings, store).await;
        }
        Backend::Picker(_) => {
            run_picker(&segment.sid, state, settings, store).await;
        }
    }
}

async fn run_sta_lta(
    sid: &str,
    params: StaLtaParams,
    state: &mut DetectorState,
    settings: &Settings,
    store: &PickStore,
) {
    let Some(buffered_segment) = state.buffer.get(sid) else {
        return;
    };
    let end = buffered_segment.end;
    if !state
        .scheduler
        .should_run(sid, end, settings.detect_every_seconds)
    {
        return;
    }

    info!(
        "Running detector for {sid} at {end:.3} (window={:.1}s)",
        settings.buffer_seconds
    );
    let triggers = match detect_sta_lta(
        buffered_segment,
        sid,
        params.fmin,
        params.fmax,
        params.sta_seconds,
        params.lta_seconds,
        params.trigger_on,
        params.trigger_off,
    ) {
        Ok(triggers) => triggers,
        Err(e) => {
            warn!("STA/LTA failed for {sid}: {e}");
            return;
        }
    };
    state.scheduler.mark_ran(sid, end);

    if triggers.is_empty() {
        return;
    }
    info!("Detector returned {} triggers for {sid}", triggers.len());

    let last_ts_on = state.scheduler.last_ts_on(sid);
    let (filtered, new_last) =
        filter_picks(&triggers, last_ts_on, settings.pick_filter_seconds);
    state.scheduler.set_last_ts_on(sid, new_last);
    info!(
        "Pick filter for {sid} kept={} dropped={} window={:.2}s",
        filtered.len(),
        triggers.len() - filtered.len(),
        settings.pick_filter_seconds
    );
    if filtered.is_empty() {
        info!(
            "All triggers for {sid} discarded within {:.2}s dedupe window",
            settings.pick_filter_seconds
        );
        return;
    }
    for trigger in &filtered {
        info!("Trigger {sid}: {:.3} -> {:.3}", trigger.t_on, trigger.t_off);
    }
    if let Err(e) = store.insert_trigger_picks(sid, &filtered).await {
        warn!("Failed to insert picks for {sid}: {e}");
    }
}

async fn run_picker(sid: &str, state: &mut DetectorState, settings: &Settings, store: &PickStore) {
    let Backend::Picker(picker) = &state.backend else {
        return;
    };
    let window_samples = picker.input_samples();

    let Some(parsed) = SourceId::parse(sid) else {
        warn!("Unable to parse source id for picker: {sid}");
        return;
    };
    let key = parsed.station_key();
    let group = state.buffer.station_buffers(&key);
    if group.is_empty() {
        return;
    }
    // Ready only when every channel of the station holds a full window.
    if group
        .iter()
        .any(|(_, seg)| seg.samples.len() < window_samples)
    {
        return;
    }

    let group_end = group
        .iter()
        .map(|(_, seg)| seg.end)
        .fold(f64::NEG_INFINITY, f64::max);
    let group_key = key.to_string();
    if !state
        .scheduler
        .should_run(&group_key, group_end, settings.detect_every_seconds)
    {
        return;
    }

    info!(
        "Running detector for {group_key} at {group_end:.3} (window={window_samples} samples, channels={})",
        group.len()
    );
    let Some(window) = build_multichannel_window(&group, window_samples) else {
        return;
    };
    let sid_for_db = window.channels[0].clone();
    let (picks, detections) = filter_classifier_output(picker.classify(&window));
    drop(group);
    state.scheduler.mark_ran(&group_key, group_end);

    if !picks.is_empty() {
        info!("Detector returned {} picks for {group_key}", picks.len());
        let last_ts_on = state.scheduler.last_ts_on(&group_key);
        let (filtered, new_last) =
            filter_picks(&picks, last_ts_on, settings.pick_filter_seconds);
        state.scheduler.set_last_ts_on(&group_key, new_last);
        info!(
            "Pick filter for {group_key} kept={} dropped={} window={:.2}s",
            filtered.len(),
            picks.len() - filtered.len(),
            settings.pick_filter_seconds
        );
        if filtered.is_empty() {
            info!(
                "All picks for {group_key} discarded within {:.2}s dedupe window",
                settings.pick_filter_seconds
            );
        } else {
            for pick in &filtered {
                info!("Pick {group_key}: {:.3} phase={}", pick.t, pick.phase);
            }
            if let Err(e) = store.insert_phase_picks(&sid_for_db, &filtered).await {
                warn!("Failed to insert phase picks for {sid_for_db}: {e}");
            }
        }
    }

    if !detections.is_empty() {
        debug!(
            "Detector returned {} event detections for {group_key}",
            detections.len()
        );
        if let Err(e) = store.insert_event_detections(&sid_for_db, &detections).await {
            warn!("Failed to insert event detections for {sid_for_db}: {e}");
        }
    }
}
