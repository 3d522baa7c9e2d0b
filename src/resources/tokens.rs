use std::collections::{HashMap, HashSet};

use futures_util::future::try_join_all;

use crate::error::ApiError;
use crate::resources::{decode_body, not_found_as, path_segment};
use crate::transport::{ApiRequest, Transport};
use crate::types::Token;

/// Client for the `/v1/tokens` resource.
#[derive(Clone)]
pub struct Tokens {
    transport: Transport,
}

impl Tokens {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Fetches token metadata by address.
    ///
    /// Unknown addresses fail with [`ApiError::NotFound`].
    pub async fn get(&self, address: &str) -> Result<Token, ApiError> {
        let address = path_segment("token address", address)?;
        let request = ApiRequest::get(format!("/v1/tokens/{address}"));
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(not_found_as("token", address))?;
        let token: Token = decode_body("token", &response)?;
        if token.address != address {
            return Err(ApiError::Decode(format!(
                "requested token {address} but server returned {}",
                token.address
            )));
        }
        Ok(token)
    }

    /// Fetches several tokens concurrently, requesting each distinct address
    /// once.
    ///
    /// The result is scoped to this call; nothing is cached across calls.
    pub async fn get_many<I, S>(&self, addresses: I) -> Result<HashMap<String, Token>, ApiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let unique: Vec<String> = addresses
            .into_iter()
            .map(|address| address.as_ref().trim().to_string())
            .filter(|address| seen.insert(address.clone()))
            .collect();

        let tokens = try_join_all(unique.iter().map(|address| self.get(address))).await?;
        Ok(unique.into_iter().zip(tokens).collect())
    }
}
