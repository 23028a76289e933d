//! Scripted provider for tests and local runs.

use crate::error::ProviderError;
use crate::provider::{Provider, ProviderInfo, RawCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_store::FetchedEvent;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

/// A fetch window the fixture was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCall {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

struct FixtureState {
    accepts_credentials: bool,
    events: Vec<FetchedEvent>,
    queued: VecDeque<Result<Vec<FetchedEvent>, ProviderError>>,
    delay: Option<Duration>,
    calls: Vec<FetchCall>,
}

/// A [`Provider`] answering from scripted data.
///
/// `get_schedule` first pops queued responses, then falls back to the
/// standing event list.
pub struct FixtureProvider {
    info: ProviderInfo,
    state: Mutex<FixtureState>,
}

impl FixtureProvider {
    /// Creates a fixture that accepts any credentials and returns no events.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            info: ProviderInfo::new(id.clone(), format!("Fixture ({id})")),
            state: Mutex::new(FixtureState {
                accepts_credentials: true,
                events: Vec::new(),
                queued: VecDeque::new(),
                delay: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Sets the standing response.
    pub async fn set_events(&self, events: Vec<FetchedEvent>) {
        self.state.lock().await.events = events;
    }

    /// Queues a one-shot response ahead of the standing one.
    pub async fn push_response(&self, response: Result<Vec<FetchedEvent>, ProviderError>) {
        self.state.lock().await.queued.push_back(response);
    }

    /// Sets the answer of `validate_credentials`.
    pub async fn set_accepts_credentials(&self, accepts: bool) {
        self.state.lock().await.accepts_credentials = accepts;
    }

    /// Delays every `get_schedule` call.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }

    /// Windows requested so far.
    pub async fn fetch_calls(&self) -> Vec<FetchCall> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }

    async fn validate_credentials(
        &self,
        _credentials: &RawCredentials,
    ) -> Result<bool, ProviderError> {
        Ok(self.state.lock().await.accepts_credentials)
    }

    async fn get_schedule(
        &self,
        _credentials: &RawCredentials,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FetchedEvent>, ProviderError> {
        let (delay, response) = {
            let mut state = self.state.lock().await;
            state.calls.push(FetchCall { from, to });
            let response = match state.queued.pop_front() {
                Some(response) => response,
                None => Ok(state.events.clone()),
            };
            (state.delay, response)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response
    }
}
