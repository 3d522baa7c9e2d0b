//! Wire models shared by the REST resources and the stream.
//!
//! Decoding is strict: unknown fields, missing fields, and confidence values
//! outside `[0, 1]` are all rejected.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Recommended trade direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        };
        f.write_str(text)
    }
}

/// Confidence score guaranteed to lie in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    pub fn new(value: f64) -> Result<Self, InvalidConfidence> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidConfidence(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = InvalidConfidence;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
#[error("confidence {0} is outside [0, 1]")]
pub struct InvalidConfidence(pub f64);

/// Token reference embedded in a signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRef {
    pub address: String,
    pub symbol: String,
}

/// Server-generated trade recommendation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Signal {
    pub id: String,
    pub token: TokenRef,
    pub action: SignalAction,
    pub confidence: Confidence,
    pub target_price: f64,
    #[serde(deserialize_with = "required_nullable")]
    pub stop_loss: Option<f64>,
    pub reasoning: String,
}

/// Tradable asset with market metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Token {
    pub address: String,
    pub symbol: String,
    pub price: f64,
    pub price_change_24h: f64,
    pub volume_24h: f64,
    pub market_cap: f64,
    pub risk_score: f64,
}

/// Tracked wallet summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Wallet {
    pub address: String,
    pub balance: f64,
    pub risk_score: f64,
    pub tags: Vec<String>,
}

/// Alert rules registered when tracking a wallet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_transaction: Option<f64>,
    pub new_tokens: bool,
    pub large_transfers: bool,
}

/// Registration returned by the wallet tracking endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WalletTracking {
    pub id: String,
    pub address: String,
    pub webhook_url: String,
}

// `Option` fields are implicitly optional in serde; routing through
// `deserialize_with` makes the key mandatory while still accepting `null`.
fn required_nullable<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)
}
