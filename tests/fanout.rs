//! End-to-end fan-out through the public service API.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use telemux::transport::{Frame, StreamKind, TransportEnd, binary};
use telemux::types::{ByteOrder, FieldDefinition, FieldType, PacketDefinition, Polynomial, Value};
use telemux::{Delivery, Dictionary, Telemux, TelemuxConfig};
use tokio::sync::mpsc;

const PWR: u32 = 7;

fn dictionary() -> Result<Arc<Dictionary>> {
    let pwr = PacketDefinition::builder(PWR, "PWR")
        .with_field(
            FieldDefinition::new("Bus", FieldType::U16(ByteOrder::Big))
                .with_conversion(Polynomial::new(vec![0.0, 0.1])),
        )
        .build()?;
    let env = PacketDefinition::builder(8, "ENV").field("Temp", FieldType::I8).build()?;
    Ok(Arc::new(Dictionary::new().with_packet(pwr)?.with_packet(env)?))
}

async fn service() -> Result<Telemux> {
    let config = TelemuxConfig { session_idle_ttl_secs: None, ..TelemuxConfig::default() };
    Ok(Telemux::start(dictionary()?, None, config).await?)
}

#[tokio::test]
async fn every_session_gets_the_raw_packet_with_its_own_counter() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let telemux = service().await?;
    let a = telemux.create_session().to_string();
    telemux.ingest_telemetry(PWR, vec![0x00, 0x00])?;

    let b = telemux.create_session().to_string();
    let delivery = telemux.ingest_telemetry(PWR, vec![0x00, 0x01])?;
    assert_eq!(delivery, Delivery::Broadcast(2));

    let a = telemux.current_session(&a)?;
    let b = telemux.current_session(&b)?;
    let a_items = a.telemetry.snapshot();
    let b_items = b.telemetry.snapshot();

    assert_eq!(a_items.len(), 2);
    assert_eq!((a_items[1].uid, &a_items[1].data[..], a_items[1].counter), (PWR, &[0x00, 0x01][..], 1));
    assert_eq!(b_items.len(), 1);
    assert_eq!((b_items[0].uid, &b_items[0].data[..], b_items[0].counter), (PWR, &[0x00, 0x01][..], 0));
    Ok(())
}

#[tokio::test]
async fn deltas_reach_a_connected_client() -> Result<()> {
    let telemux = service().await?;
    let token = telemux.create_session().to_string();
    let (tx, mut rx) = mpsc::channel(8);
    let transport = telemux.transport(&token, StreamKind::Deltas, tx)?;
    let task = tokio::spawn(transport.run());

    telemux.ingest_telemetry(8, vec![0xFE])?;
    telemux.ingest_telemetry(8, vec![0xFE])?;
    telemux.ingest_telemetry(8, vec![0xFD])?;

    let mut envelopes = Vec::new();
    for _ in 0..3 {
        let Some(Frame::Text(json)) = rx.recv().await else { anyhow::bail!("expected a JSON envelope") };
        envelopes.push(serde_json::from_str::<serde_json::Value>(&json)?);
    }

    assert_eq!(envelopes[0]["data"], serde_json::json!({"Temp": -2}));
    assert_eq!(envelopes[1]["data"], serde_json::json!({}));
    assert_eq!(envelopes[2]["data"], serde_json::json!({"Temp": -3}));
    assert_eq!(envelopes[2]["counter"], 2);

    telemux.remove_session(&token)?;
    assert_eq!(task.await?.end, TransportEnd::SessionClosed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_binary_stream_sends_null_packets() -> Result<()> {
    let telemux = service().await?;
    let token = telemux.create_session().to_string();
    let (tx, mut rx) = mpsc::channel(8);
    let transport = telemux.transport(&token, StreamKind::Telemetry, tx)?;
    tokio::spawn(transport.run());

    let started = tokio::time::Instant::now();
    let Some(Frame::Binary(frame)) = rx.recv().await else { anyhow::bail!("expected a binary frame") };
    assert!(binary::is_keepalive(&frame));
    assert!(started.elapsed() >= Duration::from_secs(30));

    telemux.ingest_telemetry(PWR, vec![0x00, 0x01])?;
    let Some(Frame::Binary(frame)) = rx.recv().await else { anyhow::bail!("expected a binary frame") };
    assert_eq!(binary::decode(&frame), Some((PWR, &[0x00, 0x01][..])));

    telemux.shutdown();
    Ok(())
}

#[tokio::test]
async fn latest_state_pairs_packet_values_with_session_counters() -> Result<()> {
    let telemux = service().await?;
    let token = telemux.create_session().to_string();
    telemux.ingest_telemetry(PWR, vec![0x00, 0x0A])?;
    telemux.ingest_telemetry(PWR, vec![0x00, 0x0A])?;

    let latest = telemux.latest(&token)?;
    assert_eq!(latest.counters["PWR"], 1);
    assert_eq!(latest.states["PWR"].raw["Bus"], Value::UInt(10));
    assert_eq!(latest.states["PWR"].converted["Bus"], Value::Float(1.0));

    let err = telemux.latest("00000000-0000-0000-0000-000000000000").unwrap_err();
    assert!(err.is_unauthorized());
    assert!(telemux.latest("garbage").unwrap_err().is_unauthorized());
    Ok(())
}

#[tokio::test]
async fn events_and_messages_reach_late_joiners_only_after_joining() -> Result<()> {
    let telemux = service().await?;
    telemux.post_event("seq:start", serde_json::json!({"name": "pass_12"}));

    let token = telemux.create_session().to_string();
    telemux.post_event("seq:done", serde_json::json!({"name": "pass_12"}));

    let session = telemux.current_session(&token)?;
    assert_eq!(session.events.snapshot().iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["seq:done"]);
    assert_eq!(telemux.registry().history().events.len(), 2);
    Ok(())
}
