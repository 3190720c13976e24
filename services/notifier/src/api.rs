//! REST client for the notification backend.
//!
//! The controller only sees the two traits below; `HttpNotificationApi` is
//! the reqwest-backed implementation used by the binary.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use hs_protocol::{
    MutationResponse, NotificationId, NotificationRecord, ProfileResponse, RemindersResponse,
    SnapshotResponse,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::navigation::Role;
use crate::transport::Identity;

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("profile did not contain a usable identity")]
    MissingIdentity,
}

/// The resolved session subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub identity: Identity,
    /// Present only when the profile response names a role.
    pub role: Option<Role>,
}

pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self) -> ApiFuture<'a, Profile>;
}

pub trait NotificationApi: Send + Sync {
    fn fetch_snapshot<'a>(&'a self) -> ApiFuture<'a, SnapshotResponse>;

    fn mark_read<'a>(&'a self, id: NotificationId) -> ApiFuture<'a, ()>;

    fn mark_all_read<'a>(&'a self) -> ApiFuture<'a, ()>;

    fn delete<'a>(&'a self, id: NotificationId) -> ApiFuture<'a, ()>;

    fn clear_all<'a>(&'a self) -> ApiFuture<'a, ()>;

    fn fetch_medicine_reminders<'a>(
        &'a self,
        prescription_id: i64,
    ) -> ApiFuture<'a, Vec<NotificationRecord>>;
}

pub struct HttpNotificationApi {
    client: reqwest::Client,
    base_url: String,
    profile_path: String,
    token: Option<String>,
}

impl HttpNotificationApi {
    pub fn new(
        base_url: &str,
        profile_path: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            profile_path: profile_path.to_owned(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "api request");
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, ApiError> {
        let resp = self.request(method, path).send().await?;
        Ok(check_status(resp)?.json::<T>().await?)
    }

    async fn send_mutation(&self, method: Method, path: &str) -> Result<(), ApiError> {
        let body: MutationResponse = self.send_json(method, path).await?;
        if body.success {
            Ok(())
        } else {
            Err(ApiError::Rejected(
                body.error.unwrap_or_else(|| "unspecified error".to_owned()),
            ))
        }
    }
}

fn check_status(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(ApiError::Status(status.as_u16()))
    }
}

fn parse_role(raw: &str) -> Option<Role> {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix("ROLE_")
        .or_else(|| raw.strip_prefix("role_"))
        .unwrap_or(raw);
    raw.parse().ok()
}

impl IdentityResolver for HttpNotificationApi {
    fn resolve<'a>(&'a self) -> ApiFuture<'a, Profile> {
        Box::pin(async move {
            let profile: ProfileResponse =
                self.send_json(Method::GET, &self.profile_path).await?;
            let identity = Identity::new(profile.id).ok_or(ApiError::MissingIdentity)?;
            Ok(Profile {
                identity,
                role: profile.role.as_deref().and_then(parse_role),
            })
        })
    }
}

impl NotificationApi for HttpNotificationApi {
    fn fetch_snapshot<'a>(&'a self) -> ApiFuture<'a, SnapshotResponse> {
        Box::pin(async move {
            let snapshot: SnapshotResponse = self.send_json(Method::GET, "/notifications").await?;
            if !snapshot.success {
                return Err(ApiError::Rejected(
                    snapshot
                        .error
                        .unwrap_or_else(|| "unspecified error".to_owned()),
                ));
            }
            Ok(snapshot)
        })
    }

    fn mark_read<'a>(&'a self, id: NotificationId) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.send_mutation(Method::PUT, &format!("/notifications/{id}/read"))
                .await
        })
    }

    fn mark_all_read<'a>(&'a self) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.send_mutation(Method::POST, "/notifications/mark-all-read")
                .await
        })
    }

    fn delete<'a>(&'a self, id: NotificationId) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.send_mutation(Method::DELETE, &format!("/notifications/{id}"))
                .await
        })
    }

    fn clear_all<'a>(&'a self) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.send_mutation(Method::DELETE, "/notifications/clear-all")
                .await
        })
    }

    fn fetch_medicine_reminders<'a>(
        &'a self,
        prescription_id: i64,
    ) -> ApiFuture<'a, Vec<NotificationRecord>> {
        Box::pin(async move {
            let body: RemindersResponse = self
                .send_json(
                    Method::GET,
                    &format!("/notifications/prescription/{prescription_id}/reminders"),
                )
                .await?;
            if !body.success {
                return Err(ApiError::Rejected(
                    body.error.unwrap_or_else(|| "unspecified error".to_owned()),
                ));
            }
            Ok(body.reminders)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_accepts_spring_prefix() {
        assert_eq!(parse_role("ROLE_DOCTOR"), Some(Role::Doctor));
        assert_eq!(parse_role("patient"), Some(Role::Patient));
        assert_eq!(parse_role("ADMIN"), None);
    }
}
