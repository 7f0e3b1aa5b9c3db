//! Runtime registry: identity, lifecycle, and capability advertisement of
//! customer-operated worker processes.

use chrono::{DateTime, Duration, Utc};
use conduit_core::contracts::{
    RuntimeCapabilitiesUpdateRequest, RuntimeCapabilitiesUpdateResponse, RuntimeHeartbeatRequest,
    RuntimeHeartbeatResponse, RuntimeInstanceView, RuntimeRegistrationRequest,
    RuntimeRegistrationResponse,
};
use conduit_core::token::RuntimeTokenService;
use conduit_core::{
    Error, RegistrationToken, RegistrationTokenStore, Result, RuntimeInstance, RuntimeStatus,
    RuntimeStore,
};
use std::sync::Arc;
use uuid::Uuid;

const MIN_REGISTRATION_TOKEN_TTL_MINUTES: i64 = 1;

pub struct RuntimeRegistry {
    runtimes: Arc<dyn RuntimeStore>,
    tokens: Arc<dyn RegistrationTokenStore>,
    auth: Arc<RuntimeTokenService>,
    registration_token_ttl: Duration,
}

impl RuntimeRegistry {
    pub fn new(
        runtimes: Arc<dyn RuntimeStore>,
        tokens: Arc<dyn RegistrationTokenStore>,
        auth: Arc<RuntimeTokenService>,
        registration_token_ttl_minutes: i64,
    ) -> Self {
        Self {
            runtimes,
            tokens,
            auth,
            registration_token_ttl: Duration::minutes(
                registration_token_ttl_minutes.max(MIN_REGISTRATION_TOKEN_TTL_MINUTES),
            ),
        }
    }

    /// Mint a one-shot registration token for a tenant. Only the hash is persisted.
    pub async fn create_registration_token(
        &self,
        tenant_id: Uuid,
        created_by_user_id: Option<Uuid>,
    ) -> Result<(String, DateTime<Utc>)> {
        let (raw_token, token_hash) = RuntimeTokenService::mint_registration_token();
        let now = Utc::now();
        let expires_at = now + self.registration_token_ttl;

        self.tokens
            .create(&RegistrationToken {
                id: Uuid::new_v4(),
                tenant_id,
                token_hash,
                expires_at,
                used_at: None,
                runtime_id: None,
                created_by_user_id,
                created_at: now,
            })
            .await?;
        Ok((raw_token, expires_at))
    }

    /// Exchange a one-shot registration token for a runtime identity and an access
    /// token. The token is consumed atomically: of two concurrent registrations, the
    /// loser fails before any runtime row is created.
    pub async fn register_runtime(
        &self,
        request: &RuntimeRegistrationRequest,
    ) -> Result<RuntimeRegistrationResponse> {
        let token_hash = RuntimeTokenService::hash_registration_token(&request.registration_token);
        let Some(token) = self.tokens.get_by_hash(&token_hash).await? else {
            return Err(Error::validation("Registration token is invalid."));
        };

        let now = Utc::now();
        if token.used_at.is_some() {
            return Err(Error::validation(
                "Registration token has already been used.",
            ));
        }
        if token.expires_at <= now {
            return Err(Error::validation("Registration token has expired."));
        }

        let runtime_id = Uuid::new_v4();
        if !self.tokens.consume(token.id, runtime_id, now).await? {
            return Err(Error::validation(
                "Registration token has already been used.",
            ));
        }

        let runtime = RuntimeInstance {
            id: runtime_id,
            tenant_id: token.tenant_id,
            display_name: request.display_name.clone(),
            tags: request.tags.clone(),
            capabilities: request.capabilities.clone(),
            metadata: request.metadata.clone(),
            status: RuntimeStatus::Active,
            last_seen_at: Some(now),
            registered_at: now,
            created_at: now,
            updated_at: now,
        };
        self.runtimes.insert(&runtime).await?;

        let (access_token, expires_at) = self.auth.issue_access_token(token.tenant_id, runtime_id)?;

        tracing::info!(
            event = "conduit.registry.registered",
            tenant_id = %token.tenant_id,
            ep_id = %runtime_id,
            "edge runtime registered"
        );
        Ok(RuntimeRegistrationResponse {
            ep_id: runtime_id,
            tenant_id: token.tenant_id,
            access_token,
            token_type: "bearer".to_string(),
            expires_at,
        })
    }

    /// Bump `last_seen_at`, optionally update status, shallow-merge metadata, and
    /// rotate the access token. Prior tokens stay valid until their natural expiry.
    pub async fn heartbeat(
        &self,
        tenant_id: Uuid,
        ep_id: Uuid,
        request: &RuntimeHeartbeatRequest,
    ) -> Result<RuntimeHeartbeatResponse> {
        let mut runtime = self.get_owned(tenant_id, ep_id).await?;
        let now = Utc::now();

        runtime.last_seen_at = Some(now);
        if let Some(status) = request.status.as_deref().and_then(RuntimeStatus::parse) {
            runtime.status = status;
        }
        for (key, value) in &request.metadata {
            runtime.metadata.insert(key.clone(), value.clone());
        }
        runtime.updated_at = now;
        self.runtimes.update(&runtime).await?;

        let (access_token, expires_at) = self.auth.issue_access_token(tenant_id, ep_id)?;
        Ok(RuntimeHeartbeatResponse {
            accepted: true,
            server_time: now,
            access_token,
            expires_at,
        })
    }

    /// Replace tags and capabilities atomically; bumps `last_seen_at`.
    pub async fn update_capabilities(
        &self,
        tenant_id: Uuid,
        ep_id: Uuid,
        request: &RuntimeCapabilitiesUpdateRequest,
    ) -> Result<RuntimeCapabilitiesUpdateResponse> {
        let mut runtime = self.get_owned(tenant_id, ep_id).await?;
        let now = Utc::now();

        runtime.tags = request.tags.clone();
        runtime.capabilities = request.capabilities.clone();
        runtime.last_seen_at = Some(now);
        runtime.updated_at = now;
        self.runtimes.update(&runtime).await?;

        Ok(RuntimeCapabilitiesUpdateResponse {
            accepted: true,
            updated_at: now,
        })
    }

    /// Pick a runtime for a new edge task: active runtimes only, freshest heartbeat
    /// first, filtered to those whose tags cover `required_tags` and whose advertised
    /// message types (if any) include `message_type`.
    pub async fn select_runtime_for_dispatch(
        &self,
        tenant_id: Uuid,
        message_type: &str,
        required_tags: Option<&[String]>,
    ) -> Result<RuntimeInstance> {
        let runtimes = self.runtimes.list_active_for_tenant(tenant_id).await?;
        if runtimes.is_empty() {
            return Err(Error::validation(
                "No active customer runtime is available for this tenant.",
            ));
        }

        let required_tags = required_tags.unwrap_or_default();
        for runtime in runtimes {
            if !required_tags
                .iter()
                .all(|tag| runtime.tags.iter().any(|t| t == tag))
            {
                continue;
            }
            let capability_types = runtime.capability_message_types();
            if !capability_types.is_empty()
                && !capability_types.iter().any(|t| t == message_type)
            {
                continue;
            }
            return Ok(runtime);
        }
        Err(Error::validation(
            "No runtime matched required tags/capabilities for this task.",
        ))
    }

    pub async fn list_runtimes_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<RuntimeInstanceView>> {
        let runtimes = self.runtimes.list_for_tenant(tenant_id).await?;
        Ok(runtimes
            .into_iter()
            .map(|runtime| RuntimeInstanceView {
                ep_id: runtime.id,
                tenant_id: runtime.tenant_id,
                display_name: runtime.display_name,
                status: runtime.status.as_str().to_string(),
                tags: runtime.tags,
                capabilities: runtime.capabilities,
                metadata: runtime.metadata,
                registered_at: runtime.registered_at,
                last_seen_at: runtime.last_seen_at,
                updated_at: Some(runtime.updated_at),
            })
            .collect())
    }

    async fn get_owned(&self, tenant_id: Uuid, ep_id: Uuid) -> Result<RuntimeInstance> {
        match self.runtimes.get(ep_id).await? {
            Some(runtime) if runtime.tenant_id == tenant_id => Ok(runtime),
            _ => Err(Error::validation(
                "Runtime instance is not registered for this tenant.",
            )),
        }
    }
}
