use std::error::Error;

use cipherx_sdk::{CipherXClient, ConnectionState, StreamEvent};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = CipherXClient::from_env()?;

        let connection = client
            .stream()
            .min_confidence(0.85)
            .on_event(|event| match event {
                StreamEvent::Signal(signal) => println!(
                    "{} {} confidence={:.2} target={}",
                    signal.action,
                    signal.token.symbol,
                    signal.confidence.value(),
                    signal.target_price,
                ),
                StreamEvent::StateChanged { from, to } => println!("state {from:?} -> {to:?}"),
                StreamEvent::Error(_) => {}
            })
            .on_error(|fault| eprintln!("stream error kind={:?}: {}", fault.kind, fault.message))
            .connect()
            .await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => connection.close(),
            _ = connection.wait_for_state(ConnectionState::Closed) => {}
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
