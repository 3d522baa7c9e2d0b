use std::sync::OnceLock;

use secrecy::SecretString;

use crate::config::ClientOptions;
use crate::error::ApiError;
use crate::resources::signals::{SignalFilter, Signals};
use crate::resources::tokens::Tokens;
use crate::resources::wallets::Wallets;
use crate::stream::client::{StreamBuilder, StreamClient, StreamError};
use crate::stream::connection::StreamConnection;
use crate::stream::proto::StreamSubscription;
use crate::transport::Transport;
use crate::types::{Signal, Token};

/// A signal paired with the current metadata of its token.
#[derive(Clone, Debug, PartialEq)]
pub struct EnrichedSignal {
    pub signal: Signal,
    pub token: Token,
}

/// Single entry point composing the transport, resource clients and stream.
pub struct CipherXClient {
    transport: Transport,
    stream: StreamClient,
    signals: OnceLock<Signals>,
    tokens: OnceLock<Tokens>,
    wallets: OnceLock<Wallets>,
}

impl CipherXClient {
    /// Creates a client against the production endpoints.
    ///
    /// An empty key is kept as "no credential": requests then fail with
    /// [`ApiError::Auth`] and streams with [`StreamError::MissingApiKey`].
    pub fn new(api_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_options(api_key, ClientOptions::default())
    }

    /// Creates a client from `CIPHERX_API_KEY` and the endpoint overrides in
    /// the environment.
    pub fn from_env() -> Result<Self, ApiError> {
        let api_key = crate::config::api_key_from_env();
        Self::with_secret(api_key, ClientOptions::from_env())
    }

    pub fn with_options(
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ApiError> {
        let api_key = api_key.into();
        let api_key = (!api_key.trim().is_empty()).then(|| SecretString::new(api_key));
        Self::with_secret(api_key, options)
    }

    pub fn with_secret(
        api_key: Option<SecretString>,
        options: ClientOptions,
    ) -> Result<Self, ApiError> {
        let transport = Transport::new(api_key.clone(), &options)?;
        let stream = StreamClient::with_options(api_key, options.stream.clone())
            .with_endpoint(options.stream_url.clone());

        Ok(Self {
            transport,
            stream,
            signals: OnceLock::new(),
            tokens: OnceLock::new(),
            wallets: OnceLock::new(),
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn signals(&self) -> &Signals {
        self.signals
            .get_or_init(|| Signals::new(self.transport.clone()))
    }

    pub fn tokens(&self) -> &Tokens {
        self.tokens.get_or_init(|| Tokens::new(self.transport.clone()))
    }

    pub fn wallets(&self) -> &Wallets {
        self.wallets
            .get_or_init(|| Wallets::new(self.transport.clone()))
    }

    /// Builder for a stream connection with handlers registered up front.
    pub fn stream(&self) -> StreamBuilder {
        self.stream.subscribe()
    }

    /// Opens a stream receiving every signal.
    pub async fn open_stream(&self) -> Result<StreamConnection, StreamError> {
        self.stream.connect(StreamSubscription::all()).await
    }

    /// Lists signals and attaches the current metadata of each signal's
    /// token, fetching every distinct token once.
    pub async fn signals_with_tokens(
        &self,
        filter: &SignalFilter,
    ) -> Result<Vec<EnrichedSignal>, ApiError> {
        let signals = self.signals().list(filter).await?;
        let tokens = self
            .tokens()
            .get_many(signals.iter().map(|signal| signal.token.address.as_str()))
            .await?;

        signals
            .into_iter()
            .map(|signal| {
                let token = tokens
                    .get(signal.token.address.trim())
                    .cloned()
                    .ok_or_else(|| ApiError::NotFound {
                        resource: "token",
                        key: signal.token.address.clone(),
                    })?;
                Ok(EnrichedSignal { signal, token })
            })
            .collect()
    }
}
