use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{self, MAX_PARAMETERS_PER_REQUEST, Operation};
use crate::scheduler::{Priority, RateLimitedScheduler, SchedulerConfig, Ticket};
use crate::token::{DEFAULT_SAFETY_MARGIN, OAuthCredentials, TokenManager, TokenStore};
use crate::types::*;
use crate::Result;

pub struct UplinkClientBuilder {
    credentials: OAuthCredentials,
    base_url: String,
    token_store: Option<Arc<dyn TokenStore>>,
    safety_margin: Duration,
    scheduler_config: SchedulerConfig,
    log_mode: Option<MessageLogMode>,
    log_path: Option<PathBuf>,
    http: Option<reqwest::Client>,
}

impl UplinkClientBuilder {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self {
            credentials,
            base_url: protocol::DEFAULT_BASE_URL.to_string(),
            token_store: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            scheduler_config: SchedulerConfig::default(),
            log_mode: None,
            log_path: None,
            http: None,
        }
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<PathBuf>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Starts the scheduler, so this must run inside a Tokio runtime.
    pub fn build(self) -> Result<UplinkClient> {
        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder().build()?,
        };

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(MessageLogger::new(mode, &path)?),
            _ => None,
        };

        let mut tokens = TokenManager::builder(self.credentials)
            .base_url(&self.base_url)
            .safety_margin(self.safety_margin)
            .http_client(http.clone());
        if let Some(store) = self.token_store {
            tokens = tokens.store(store);
        }
        let tokens = Arc::new(tokens.build()?);

        let scheduler = RateLimitedScheduler::start(
            http,
            self.base_url,
            tokens.clone(),
            self.scheduler_config,
            logger,
        );
        Ok(UplinkClient { tokens, scheduler })
    }
}

/// Typed access to the Uplink API. Every call goes through the shared
/// [`RateLimitedScheduler`]; clones share the scheduler and token manager.
/// Outcome of one chunk of a parameter read.
pub(crate) struct ParameterBatch {
    pub(crate) parameter_ids: Vec<ParameterId>,
    pub(crate) result: Result<Vec<Parameter>>,
}

#[derive(Clone)]
pub struct UplinkClient {
    tokens: Arc<TokenManager>,
    scheduler: RateLimitedScheduler,
}

impl UplinkClient {
    pub fn builder(credentials: OAuthCredentials) -> UplinkClientBuilder {
        UplinkClientBuilder::new(credentials)
    }

    pub fn from_parts(tokens: Arc<TokenManager>, scheduler: RateLimitedScheduler) -> Self {
        Self { tokens, scheduler }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn scheduler(&self) -> &RateLimitedScheduler {
        &self.scheduler
    }

    pub fn write_access(&self) -> bool {
        self.tokens.write_access()
    }

    /// Exchange the consent code captured from the browser redirect.
    pub async fn authorize(&self, authorization_code: &str) -> Result<Token> {
        let token = self.tokens.exchange(authorization_code).await?;
        info!("uplink authorization complete");
        Ok(token)
    }

    /// Queue an operation once a token is known to be obtainable. A revoked or
    /// missing authorization fails here without touching the queue; transient
    /// token trouble is left to the scheduler's retries.
    pub(crate) async fn submit(&self, operation: Operation, priority: Priority) -> Result<Ticket> {
        if let Err(e) = self.tokens.get_valid_token().await
            && e.is_revoked()
        {
            debug!(kind = ?operation.kind(), error = %e, "not submitting, authorization unavailable");
            return Err(e);
        }
        Ok(self.scheduler.submit(operation, priority))
    }

    pub async fn list_systems(&self) -> Result<Vec<System>> {
        let body = self.submit(Operation::ListSystems, Priority::Normal).await?.await?;
        let mut systems = protocol::parse_systems(&body)?;
        for system in &mut systems {
            system.capabilities.write_access = self.write_access();
        }
        debug!(count = systems.len(), "systems discovered");
        Ok(systems)
    }

    pub async fn fetch_system(&self, system_id: SystemId) -> Result<System> {
        let body = self
            .submit(Operation::ReadSystem { system_id }, Priority::Normal)
            .await?
            .await?;
        let mut system = protocol::parse_system(&body)?;
        system.capabilities.write_access = self.write_access();
        Ok(system)
    }

    pub async fn fetch_parameters(&self, system_id: SystemId, parameter_ids: &[ParameterId]) -> Result<Vec<Parameter>> {
        let mut parameters = Vec::with_capacity(parameter_ids.len());
        for batch in self.read_parameters(system_id, parameter_ids, Priority::Normal).await? {
            parameters.extend(batch.result?);
        }
        Ok(parameters)
    }

    /// Reads in batches of at most 15 ids. All batches are queued before the
    /// first one is awaited, and each batch succeeds or fails on its own.
    pub(crate) async fn read_parameters(
        &self,
        system_id: SystemId,
        parameter_ids: &[ParameterId],
        priority: Priority,
    ) -> Result<Vec<ParameterBatch>> {
        let mut tickets = Vec::new();
        for chunk in parameter_ids.chunks(MAX_PARAMETERS_PER_REQUEST) {
            let operation = Operation::ReadParameters {
                system_id,
                parameter_ids: chunk.to_vec(),
            };
            tickets.push((chunk, self.submit(operation, priority).await?));
        }

        let mut batches = Vec::with_capacity(tickets.len());
        for (chunk, ticket) in tickets {
            let result = ticket.await.and_then(|body| protocol::parse_parameters(&body));
            if let Err(e) = &result {
                debug!(system = %system_id, count = chunk.len(), error = %e, "parameter batch failed");
            }
            batches.push(ParameterBatch {
                parameter_ids: chunk.to_vec(),
                result,
            });
        }
        Ok(batches)
    }

    /// Write one parameter. Success means the remote accepted the value; it
    /// shows up in reads only after the heat pump applies it.
    pub async fn set_parameter(
        &self,
        system_id: SystemId,
        menu_id: Option<&str>,
        parameter_id: ParameterId,
        value: &str,
    ) -> Result<WriteAck> {
        let operation = Operation::WriteParameter {
            system_id,
            menu_id: menu_id.map(str::to_string),
            parameter_id,
            value: value.to_string(),
        };
        let body = self.submit(operation, Priority::Interactive).await?.await?;
        protocol::parse_write_ack(parameter_id, value, &body)
    }

    pub async fn fetch_status(&self, system_id: SystemId) -> Result<Vec<StatusIcon>> {
        let body = self
            .submit(Operation::ReadStatus { system_id }, Priority::Background)
            .await?
            .await?;
        protocol::parse_status(&body)
    }

    /// Active alarms.
    pub async fn fetch_notifications(&self, system_id: SystemId) -> Result<Vec<Notification>> {
        let body = self
            .submit(Operation::ReadNotifications { system_id }, Priority::Background)
            .await?
            .await?;
        protocol::parse_notifications(&body)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::error::AuthError;

    #[tokio::test]
    async fn unauthorized_client_fails_before_queueing() {
        let client = UplinkClient::builder(OAuthCredentials::new("id", "secret", "cb", false))
            .base_url("http://127.0.0.1:9")
            .build()
            .unwrap();
        let err = client.fetch_system(SystemId(1)).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NotAuthorized)));
        assert_eq!(client.scheduler().pending(), 0);
        assert_eq!(client.scheduler().dispatched(), 0);
        assert!(!client.write_access());
    }
}
