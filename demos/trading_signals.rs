use std::error::Error;

use cipherx_sdk::{CipherXClient, SignalFilter};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Reads CIPHERX_API_KEY (and optional URL overrides) from the environment or .env.
        let client = CipherXClient::from_env()?;

        let filter = SignalFilter::new().min_confidence(0.8).limit(5);
        for item in client.signals_with_tokens(&filter).await? {
            let signal = &item.signal;
            println!(
                "{} {} confidence={:.2} target={} stop_loss={:?} price={} risk={}",
                signal.action,
                signal.token.symbol,
                signal.confidence.value(),
                signal.target_price,
                signal.stop_loss,
                item.token.price,
                item.token.risk_score,
            );
            println!("  {}", signal.reasoning);
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
