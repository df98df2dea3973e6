//! # Shared HTTP environment
//!
//! [`MopEnv`] owns the [`ureq::Agent`] used by every remote collaborator of the
//! pipeline (survey archives, telescope scheduler). It is cheap to clone: the
//! agent shares its connection pool between clones.
//!
//! Every call returns a [`Result`]: a non-2xx status surfaces as
//! [`ureq::Error::StatusCode`] wrapped in [`MopError::UreqHttpError`].
use std::convert::TryFrom;
use std::{fmt::Debug, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use ureq::{
    http::{self, Uri},
    Agent,
};

use crate::mop_errors::MopError;

/// Timeout applied to a whole request when none is configured.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MopEnv {
    pub http_client: Agent,
}

impl Default for MopEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl MopEnv {
    /// Environment with the default request timeout.
    pub fn new() -> Self {
        MopEnv::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let agent: Agent = config.into();

        MopEnv { http_client: agent }
    }

    /// GET `url` and return the body as text.
    pub fn get_from_url<U>(&self, url: U) -> Result<String, MopError>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
    {
        Ok(self
            .http_client
            .get(url)
            .call()?
            .body_mut()
            .read_to_string()?)
    }

    /// GET `url` with a token and decode the JSON body.
    pub fn get_json<U, T>(&self, url: U, token: &str, query: &[(&str, &str)]) -> Result<T, MopError>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
        T: DeserializeOwned,
    {
        Ok(self
            .http_client
            .get(url)
            .header("Authorization", &format!("Token {token}"))
            .query_pairs(query.iter().copied())
            .call()?
            .body_mut()
            .read_json()?)
    }

    /// POST `payload` as JSON with a token and decode the JSON answer.
    pub fn post_json<U, P, T>(&self, url: U, token: &str, payload: &P) -> Result<T, MopError>
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<http::Error>,
        P: Serialize,
        T: DeserializeOwned,
    {
        Ok(self
            .http_client
            .post(url)
            .header("Authorization", &format!("Token {token}"))
            .send_json(payload)?
            .body_mut()
            .read_json()?)
    }
}
