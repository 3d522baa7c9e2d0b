use crate::error::ApiError;
use crate::resources::{decode_body, not_found_as, path_segment};
use crate::transport::{ApiRequest, Transport};
use crate::types::{AlertRules, Wallet, WalletTracking};

/// Client for the `/v1/wallets` resource.
#[derive(Clone)]
pub struct Wallets {
    transport: Transport,
}

impl Wallets {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn get(&self, address: &str) -> Result<Wallet, ApiError> {
        let address = path_segment("wallet address", address)?;
        let request = ApiRequest::get(format!("/v1/wallets/{address}"));
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(not_found_as("wallet", address))?;
        decode_body("wallet", &response)
    }

    /// Registers alert rules for a wallet and returns the webhook registration.
    pub async fn track(
        &self,
        address: &str,
        rules: &AlertRules,
    ) -> Result<WalletTracking, ApiError> {
        let address = path_segment("wallet address", address)?;
        if let Some(min) = rules.min_transaction {
            if !min.is_finite() || min < 0.0 {
                return Err(ApiError::InvalidRequest(format!(
                    "min_transaction must be a non-negative number, got {min}"
                )));
            }
        }

        let body = serde_json::to_value(rules)
            .map_err(|err| ApiError::InvalidRequest(format!("alert rules: {err}")))?;
        let request = ApiRequest::post(format!("/v1/wallets/{address}/track")).json(body);
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(not_found_as("wallet", address))?;
        decode_body("wallet tracking", &response)
    }
}
