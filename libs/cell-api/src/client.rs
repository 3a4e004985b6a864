//! HTTP client for a cell's auction endpoints.
//!
//! The auction loop has a tight latency budget, so `State` is issued on a
//! dedicated client with its own short timeout while `Perform`, stop, and
//! cancel share a regular client.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::{CellState, Work};

/// Errors from talking to a cell.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),
}

/// Builds [`Client`]s that share a pair of HTTP clients across cells.
#[derive(Clone)]
pub struct ClientFactory {
    client: reqwest::Client,
    state_client: reqwest::Client,
    state_client_timeout: Duration,
}

impl ClientFactory {
    pub fn new(
        client: reqwest::Client,
        state_client: reqwest::Client,
        state_client_timeout: Duration,
    ) -> Self {
        Self {
            client,
            state_client,
            state_client_timeout,
        }
    }

    /// A factory with a default regular client and the given state timeout.
    pub fn with_state_timeout(state_client_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let state_client = reqwest::Client::builder()
            .timeout(state_client_timeout)
            .build()?;
        Ok(Self::new(client, state_client, state_client_timeout))
    }

    pub fn create_client(&self, address: &str) -> Client {
        Client {
            client: self.client.clone(),
            state_client: self.state_client.clone(),
            state_client_timeout: self.state_client_timeout,
            address: address.trim_end_matches('/').to_string(),
        }
    }
}

/// Client for one cell, addressed by its advertised `rep_address`.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    state_client: reqwest::Client,
    state_client_timeout: Duration,
    address: String,
}

impl Client {
    pub fn new(
        client: reqwest::Client,
        state_client: reqwest::Client,
        state_client_timeout: Duration,
        address: &str,
    ) -> Self {
        ClientFactory::new(client, state_client, state_client_timeout).create_client(address)
    }

    pub fn state_client_timeout(&self) -> Duration {
        self.state_client_timeout
    }

    /// Fetch the cell's state snapshot on the tight-timeout client.
    pub async fn state(&self) -> Result<CellState, ClientError> {
        let url = format!("{}/state", self.address);
        let response = self.state_client.get(&url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(ClientError::UnexpectedStatus(response.status()));
        }

        Ok(response.json().await?)
    }

    /// Submit a work batch; the response is the work the cell rejected.
    pub async fn perform(&self, work: &Work) -> Result<Work, ClientError> {
        let url = format!("{}/work", self.address);
        let response = self.client.post(&url).json(work).send().await?;

        if response.status() != StatusCode::OK {
            return Err(ClientError::UnexpectedStatus(response.status()));
        }

        Ok(response.json().await?)
    }

    /// Ask the cell to stop one LRP instance. 202 means accepted.
    pub async fn stop_lrp_instance(
        &self,
        process_guid: &str,
        instance_guid: &str,
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/v1/lrps/{}/instances/{}/stop",
            self.address, process_guid, instance_guid
        );
        let response = self.client.post(&url).send().await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(ClientError::UnexpectedStatus(response.status()));
        }

        Ok(())
    }

    /// Ask the cell to cancel one task. 202 means accepted.
    pub async fn cancel_task(&self, task_guid: &str) -> Result<(), ClientError> {
        let url = format!("{}/v1/tasks/{}/cancel", self.address, task_guid);
        let response = self.client.post(&url).send().await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(ClientError::UnexpectedStatus(response.status()));
        }

        Ok(())
    }
}
