//! Token verification through the TokenReview API.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{
    TokenReview as K8sTokenReview, TokenReviewSpec, TokenReviewStatus,
};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, instrument};

use searchgate_domain::identity::token_fingerprint;
use searchgate_domain::model::TokenReview;
use searchgate_domain::{DomainError, DomainResult, IdentityProvider, UserInfo};

pub struct TokenReviewProvider {
    client: Client,
}

impl TokenReviewProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Maps a review status to the domain shape. A missing status is unauthenticated.
pub fn token_review_from_status(status: Option<TokenReviewStatus>) -> TokenReview {
    let Some(status) = status else {
        return TokenReview {
            authenticated: false,
            user: UserInfo::default(),
        };
    };
    let user = status
        .user
        .map(|u| UserInfo {
            uid: u.uid.unwrap_or_default(),
            username: u.username.unwrap_or_default(),
            groups: u.groups.unwrap_or_default(),
            extra: u.extra.unwrap_or_default(),
        })
        .unwrap_or_default();
    TokenReview {
        authenticated: status.authenticated.unwrap_or(false),
        user,
    }
}

#[async_trait]
impl IdentityProvider for TokenReviewProvider {
    #[instrument(skip_all, fields(token = %token_fingerprint(token)))]
    async fn review_token(&self, token: &str) -> DomainResult<TokenReview> {
        let api: Api<K8sTokenReview> = Api::all(self.client.clone());
        let review = K8sTokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| DomainError::IdentityProviderError {
                message: e.to_string(),
            })?;

        let result = token_review_from_status(created.status);
        debug!(authenticated = result.authenticated, uid = %result.user.uid, "Token reviewed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo as K8sUserInfo;
    use std::collections::BTreeMap;

    #[test]
    fn test_authenticated_status_maps_user() {
        // Arrange
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(K8sUserInfo {
                uid: Some("uid-1".to_string()),
                username: Some("alice".to_string()),
                groups: Some(vec!["devs".to_string()]),
                extra: Some(BTreeMap::from([(
                    "scopes".to_string(),
                    vec!["user:full".to_string()],
                )])),
            }),
            ..Default::default()
        };

        // Act
        let review = token_review_from_status(Some(status));

        // Assert
        assert!(review.authenticated);
        assert_eq!(review.user.uid, "uid-1");
        assert_eq!(review.user.username, "alice");
        assert_eq!(review.user.groups, vec!["devs".to_string()]);
        assert_eq!(review.user.extra["scopes"], vec!["user:full".to_string()]);
    }

    #[test]
    fn test_missing_status_is_unauthenticated() {
        let review = token_review_from_status(None);

        assert!(!review.authenticated);
        assert!(review.user.uid.is_empty());
    }

    #[test]
    fn test_rejected_token_is_unauthenticated() {
        let status = TokenReviewStatus {
            authenticated: Some(false),
            error: Some("token expired".to_string()),
            ..Default::default()
        };

        let review = token_review_from_status(Some(status));

        assert!(!review.authenticated);
    }
}
