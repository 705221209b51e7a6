//! Wires a staged hotkey to a macro and feeds it synthetic key events.
//!
//! Pressing Ctrl+K then M, with Ctrl still held, plays back "hi" followed by
//! Enter. Run with `RUST_LOG=debug` to watch dispatch and playback.

use std::sync::Arc;
use std::time::Duration;

use hotmacro::{Modifiers, Paced, Polarity, Registry, Result, Router, Sender, Signal};
use keyplay::{Macro, PlaybackConfig};
use keystage::{BlockPolicy, Stage, Staged};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const KEY_LEFT_CTRL: u32 = 29;
const KEY_K: u32 = 37;
const KEY_M: u32 = 50;
const KEY_H: u32 = 35;
const KEY_I: u32 = 23;
const KEY_ENTER: u32 = 28;

/// Prints outgoing signals instead of driving a device
struct Printer;

impl Sender for Printer {
    fn send(&self, signal: &Signal) -> Result<()> {
        println!("send {:?} {:?}", signal.kind(), signal.payload());
        Ok(())
    }
}

fn tap(code: u32) -> [Signal; 3] {
    [
        Signal::key(code, Polarity::Down),
        Signal::key(code, Polarity::Up),
        Signal::delay(Duration::from_millis(15)),
    ]
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("keyplay=info".parse()?))
        .init();

    let registry = Arc::new(Registry::new());
    registry.map_modifier_key(KEY_LEFT_CTRL, Modifiers::CTRL)?;
    let router = Arc::new(Router::new(registry));

    let signals: Vec<Signal> = [KEY_H, KEY_I, KEY_ENTER].into_iter().flat_map(tap).collect();
    let greeting = Arc::new(
        Macro::builder("greeting", Paced::new(Printer))
            .with_signals(signals)
            .with_config(PlaybackConfig::default().with_blocking(true))
            .on_error(|name, e| eprintln!("macro {name} failed: {e}"))
            .build(),
    );
    greeting.enable();

    let trigger = greeting.clone();
    let chord = Arc::new(
        Staged::new(move |_, _| {
            trigger.trigger();
        })
        .with_stages(vec![
            Stage::new(Signal::key(KEY_K, Polarity::Down)).with_modifiers(Modifiers::CTRL),
            Stage::new(Signal::key(KEY_M, Polarity::Down)),
        ])
        .with_policy(BlockPolicy::BlockFinal),
    );
    chord.attach(&router)?;

    let input = [
        Signal::key(KEY_LEFT_CTRL, Polarity::Down),
        Signal::key(KEY_K, Polarity::Down),
        Signal::key(KEY_K, Polarity::Up),
        Signal::key(KEY_M, Polarity::Down),
        Signal::key(KEY_LEFT_CTRL, Polarity::Up),
    ];
    for signal in &input {
        let blocked = router.dispatch(signal);
        info!("dispatched {:?} blocked={}", signal.payload(), blocked);
    }

    std::thread::sleep(Duration::from_millis(300));
    info!("playback finished: {:?}", greeting.stats());
    Ok(())
}
