//! Access and rules reviews performed while impersonating the caller.

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes as K8sResourceAttributes, ResourceRule as K8sResourceRule,
    SelfSubjectAccessReview, SelfSubjectAccessReviewSpec, SelfSubjectRulesReview,
    SelfSubjectRulesReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::{Client, Config};
use moka::future::Cache;
use std::time::Duration;
use tracing::{debug, instrument};

use searchgate_domain::model::{ResourceAttributes, ResourceRule};
use searchgate_domain::{AccessReviewer, DomainError, DomainResult, UserInfo};

const IMPERSONATE_UID: &str = "impersonate-uid";

fn review_error(e: impl std::fmt::Display) -> DomainError {
    DomainError::AuthorizationReviewError {
        message: e.to_string(),
    }
}

/// Bounds on the per-principal client cache.
#[derive(Debug, Clone, Copy)]
pub struct ClientCacheLimits {
    pub max_clients: u64,
    /// A client unused for this long is dropped along with its connections.
    pub idle: Duration,
}

impl Default for ClientCacheLimits {
    fn default() -> Self {
        Self {
            max_clients: 1_000,
            idle: Duration::from_secs(10 * 60),
        }
    }
}

fn client_cache<V>(limits: ClientCacheLimits) -> Cache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(limits.max_clients)
        .time_to_idle(limits.idle)
        .build()
}

/// Issues self-subject reviews through a client that impersonates the principal.
///
/// One client is kept per distinct (uid, username, groups) so the underlying
/// connection pool is reused across reviews for the same caller. Idle clients
/// are evicted.
pub struct ImpersonatingReviewer {
    base: Config,
    clients: Cache<String, Client>,
}

impl ImpersonatingReviewer {
    pub fn new(base: Config, limits: ClientCacheLimits) -> Self {
        Self {
            base,
            clients: client_cache(limits),
        }
    }

    /// Returns a client acting as `principal`.
    pub async fn client_for(&self, principal: &UserInfo) -> DomainResult<Client> {
        let key = impersonation_key(principal);
        if let Some(client) = self.clients.get(&key).await {
            return Ok(client);
        }

        let config = impersonating_config(&self.base, principal)?;
        let client = Client::try_from(config).map_err(review_error)?;

        debug!(uid = %principal.uid, "Created impersonating client");
        self.clients.insert(key, client.clone()).await;
        Ok(client)
    }

    pub async fn cached_clients(&self) -> u64 {
        self.clients.run_pending_tasks().await;
        self.clients.entry_count()
    }
}

/// `base` with the principal's username, groups and UID impersonated.
fn impersonating_config(base: &Config, principal: &UserInfo) -> DomainResult<Config> {
    let mut config = base.clone();
    config.auth_info.impersonate = Some(principal.username.clone());
    config.auth_info.impersonate_groups =
        (!principal.groups.is_empty()).then(|| principal.groups.clone());
    if !principal.uid.is_empty() {
        let uid = HeaderValue::from_str(&principal.uid).map_err(review_error)?;
        config.headers.push((HeaderName::from_static(IMPERSONATE_UID), uid));
    }
    Ok(config)
}

fn impersonation_key(principal: &UserInfo) -> String {
    format!(
        "{}|{}|{}",
        principal.uid,
        principal.username,
        principal.groups.join(",")
    )
}

fn access_review(attributes: &ResourceAttributes) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(K8sResourceAttributes {
                verb: Some(attributes.verb.clone()),
                group: Some(attributes.api_group.clone()),
                resource: Some(attributes.kind.clone()),
                namespace: attributes.namespace.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn to_domain_rule(rule: K8sResourceRule) -> ResourceRule {
    ResourceRule {
        verbs: rule.verbs,
        api_groups: rule.api_groups.unwrap_or_default(),
        resources: rule.resources.unwrap_or_default(),
        resource_names: rule.resource_names.unwrap_or_default(),
    }
}

#[async_trait]
impl AccessReviewer for ImpersonatingReviewer {
    #[instrument(skip(self, principal), fields(uid = %principal.uid))]
    async fn review_access(
        &self,
        principal: &UserInfo,
        attributes: &ResourceAttributes,
    ) -> DomainResult<bool> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client_for(principal).await?);
        let created = api
            .create(&PostParams::default(), &access_review(attributes))
            .await
            .map_err(review_error)?;
        Ok(created.status.is_some_and(|s| s.allowed))
    }

    #[instrument(skip(self, principal), fields(uid = %principal.uid))]
    async fn review_rules(
        &self,
        principal: &UserInfo,
        namespace: &str,
    ) -> DomainResult<Vec<ResourceRule>> {
        let api: Api<SelfSubjectRulesReview> = Api::all(self.client_for(principal).await?);
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            ..Default::default()
        };
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(review_error)?;

        let Some(status) = created.status else {
            return Ok(Vec::new());
        };
        if status.incomplete {
            debug!(
                namespace,
                error = ?status.evaluation_error,
                "Rules review incomplete; using the rules returned"
            );
        }
        Ok(status.resource_rules.into_iter().map(to_domain_rule).collect())
    }
}
