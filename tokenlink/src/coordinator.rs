//! Single-flight refresh of the credential pair
//!
//! However many requests find the access token expired at the same time,
//! only one refresh request is sent. Every request that asks for a refresh
//! while one is running waits on that refresh and receives its outcome.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use reqwest::header::HeaderMap;
use tokenlink_tokens::CredentialPair;
use tokio::sync::watch;
use tracing::Instrument;

use crate::{
    diagnostics::Diagnostics,
    error::{Hook, RefreshError},
    hooks::{RefreshBodySource, RefreshCompletion, RefreshResponse},
};

/// The result of a refresh attempt
#[derive(Clone, Debug)]
pub enum RefreshOutcome {
    /// The refresh produced a usable credential pair
    Success(CredentialPair),
    /// The refresh failed; the request needing it cannot proceed
    Failure(RefreshError),
}

impl RefreshOutcome {
    /// Converts the outcome into a `Result`
    pub fn into_result(self) -> Result<CredentialPair, RefreshError> {
        match self {
            RefreshOutcome::Success(pair) => Ok(pair),
            RefreshOutcome::Failure(err) => Err(err),
        }
    }

    /// Whether the refresh succeeded
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Success(_))
    }
}

type InFlight = watch::Receiver<Option<RefreshOutcome>>;

/// Coordinates refreshes so that at most one is in flight at a time
///
/// Clones share the same in-flight slot. Independently constructed
/// coordinators never share a refresh.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    api_url: reqwest::Url,
    headers: HeaderMap,
    body_source: Arc<dyn RefreshBodySource>,
    completion: Arc<dyn RefreshCompletion>,
    diagnostics: Diagnostics,
    in_flight: Mutex<Option<InFlight>>,
    settled: AtomicU64,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("api_url", &self.inner.api_url.as_str())
            .field("headers", &self.inner.headers)
            .field("diagnostics", &self.inner.diagnostics)
            .field("in_flight", &self.is_refreshing())
            .finish()
    }
}

impl RefreshCoordinator {
    pub(crate) fn new(
        client: reqwest::Client,
        api_url: reqwest::Url,
        headers: HeaderMap,
        body_source: Arc<dyn RefreshBodySource>,
        completion: Arc<dyn RefreshCompletion>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                api_url,
                headers,
                body_source,
                completion,
                diagnostics,
                in_flight: Mutex::new(None),
                settled: AtomicU64::new(0),
            }),
        }
    }

    /// Refreshes `current`, or waits on the refresh already in flight
    ///
    /// The refresh itself runs on a spawned task, so it completes for the
    /// remaining waiters even if this future is dropped. Must be called
    /// from within a Tokio runtime.
    pub async fn refresh(&self, current: CredentialPair) -> RefreshOutcome {
        let mut in_flight = self.join_or_start(current);

        let outcome = match in_flight.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        outcome.unwrap_or(RefreshOutcome::Failure(RefreshError::Interrupted))
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.slot().is_some()
    }

    /// The number of refreshes that have settled, successfully or not
    ///
    /// The count is advanced before waiters are given the outcome.
    pub fn settled_count(&self) -> u64 {
        self.inner.settled.load(Ordering::Acquire)
    }

    fn join_or_start(&self, current: CredentialPair) -> InFlight {
        // The slot must be checked and claimed without yielding in between.
        let mut slot = self.inner.slot();
        if let Some(in_flight) = slot.as_ref() {
            self.inner.diagnostics.refresh_joined();
            return in_flight.clone();
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let settle = SettleGuard {
            inner: Arc::clone(&self.inner),
            tx: Some(tx),
        };

        tokio::spawn(
            async move {
                let outcome = settle.inner.perform(current).await;
                settle.publish(outcome);
            }
            .in_current_span(),
        );

        rx
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn perform(&self, current: CredentialPair) -> RefreshOutcome {
        self.diagnostics.refresh_started(&self.api_url);

        let outcome = match self.request_new_pair(&current).await {
            Ok(Some(pair)) if pair.is_usable() => RefreshOutcome::Success(pair),
            Ok(_) => RefreshOutcome::Failure(RefreshError::NoUsableTokens),
            Err(err) => RefreshOutcome::Failure(err),
        };

        if let RefreshOutcome::Failure(err) = &outcome {
            tracing::warn!(
                error = (err as &dyn std::error::Error),
                api_url = %self.api_url,
                "token refresh failed"
            );
        }

        self.diagnostics.refresh_settled(&outcome);
        outcome
    }

    async fn request_new_pair(
        &self,
        current: &CredentialPair,
    ) -> Result<Option<CredentialPair>, RefreshError> {
        let body = self
            .body_source
            .fetch_body(current)
            .await
            .map_err(|err| RefreshError::hook(Hook::FetchBody, err))?;

        let resp = self
            .client
            .post(self.api_url.clone())
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        self.diagnostics.refresh_response(status);

        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        self.completion
            .on_refresh_complete(RefreshResponse::new(status, headers, body))
            .await
            .map_err(|err| RefreshError::hook(Hook::OnRefreshComplete, err))
    }
}

/// Publishes the outcome of a refresh and frees the in-flight slot
///
/// If the refresh task ends without publishing, dropping the guard still
/// frees the slot, and waiters observe [`RefreshError::Interrupted`].
struct SettleGuard {
    inner: Arc<Inner>,
    tx: Option<watch::Sender<Option<RefreshOutcome>>>,
}

impl SettleGuard {
    fn publish(mut self, outcome: RefreshOutcome) {
        let mut slot = self.inner.slot();
        *slot = None;
        self.inner.settled.fetch_add(1, Ordering::AcqRel);
        if let Some(tx) = self.tx.take() {
            // Waiters may all have gone away; the outcome is simply dropped then.
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.inner.slot().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokenlink_tokens::{AccessToken, RefreshToken};
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::hooks::HookError;

    fn pair(access: &str, refresh: &str) -> CredentialPair {
        CredentialPair::new(
            AccessToken::new(access.to_owned()),
            RefreshToken::new(refresh.to_owned()),
        )
    }

    struct JsonHooks {
        completions: AtomicUsize,
    }

    impl JsonHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                completions: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RefreshBodySource for JsonHooks {
        async fn fetch_body(
            &self,
            current: &CredentialPair,
        ) -> Result<serde_json::Value, HookError> {
            Ok(serde_json::json!({
                "refreshToken": current.refresh_token().map(|t| t.as_str()),
            }))
        }
    }

    #[async_trait]
    impl RefreshCompletion for JsonHooks {
        async fn on_refresh_complete(
            &self,
            response: RefreshResponse,
        ) -> Result<Option<CredentialPair>, HookError> {
            self.completions.fetch_add(1, Ordering::SeqCst);

            #[derive(serde::Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Tokens {
                access_token: Option<String>,
                refresh_token: Option<String>,
            }

            if !response.status().is_success() {
                return Ok(None);
            }

            let tokens: Tokens = response.json()?;
            Ok(Some(CredentialPair::from_parts(
                tokens.access_token.map(AccessToken::new),
                tokens.refresh_token.map(RefreshToken::new),
            )))
        }
    }

    struct FailingBody;

    #[async_trait]
    impl RefreshBodySource for FailingBody {
        async fn fetch_body(&self, _: &CredentialPair) -> Result<serde_json::Value, HookError> {
            Err("refresh token storage unavailable".into())
        }
    }

    fn coordinator_for(
        api_url: &str,
        body_source: Arc<dyn RefreshBodySource>,
        completion: Arc<dyn RefreshCompletion>,
    ) -> RefreshCoordinator {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        RefreshCoordinator::new(
            reqwest::Client::new(),
            reqwest::Url::parse(api_url).unwrap(),
            headers,
            body_source,
            completion,
            Diagnostics::new(true),
        )
    }

    async fn mount_refresh(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({ "refreshToken": "R1" })))
            .respond_with(response)
            .mount(server)
            .await;
    }

    mod when_refresh_succeeds {
        use super::*;

        #[tokio::test]
        async fn returns_the_new_pair() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2", "refreshToken": "R2" })),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert_eq!(outcome.into_result().unwrap(), pair("A2", "R2"));
            assert!(!coordinator.is_refreshing());
        }

        #[tokio::test]
        async fn concurrent_callers_share_one_refresh_request() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2", "refreshToken": "R2" }))
                    .set_delay(Duration::from_millis(200)),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let outcomes = futures::future::join_all(
                (0..5).map(|_| coordinator.refresh(pair("A1", "R1"))),
            )
            .await;

            for outcome in outcomes {
                assert_eq!(outcome.into_result().unwrap(), pair("A2", "R2"));
            }
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
            assert_eq!(hooks.completions.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn a_later_refresh_starts_a_new_request() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2", "refreshToken": "R2" })),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            assert_eq!(coordinator.settled_count(), 0);
            assert!(coordinator.refresh(pair("A1", "R1")).await.is_success());
            assert_eq!(coordinator.settled_count(), 1);
            assert!(coordinator.refresh(pair("A1", "R1")).await.is_success());
            assert_eq!(coordinator.settled_count(), 2);

            assert_eq!(server.received_requests().await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn dropping_a_waiter_does_not_cancel_the_refresh() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2", "refreshToken": "R2" }))
                    .set_delay(Duration::from_millis(200)),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let abandoned = tokio::time::timeout(
                Duration::from_millis(20),
                coordinator.refresh(pair("A1", "R1")),
            )
            .await;
            assert!(abandoned.is_err());

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert_eq!(outcome.into_result().unwrap(), pair("A2", "R2"));
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }

    mod when_refresh_fails {
        use super::*;

        #[tokio::test]
        async fn missing_tokens_fail_every_waiter() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2" }))
                    .set_delay(Duration::from_millis(100)),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let outcomes = futures::future::join_all(
                (0..3).map(|_| coordinator.refresh(pair("A1", "R1"))),
            )
            .await;

            for outcome in outcomes {
                assert!(matches!(
                    outcome,
                    RefreshOutcome::Failure(RefreshError::NoUsableTokens)
                ));
            }
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
            assert!(!coordinator.is_refreshing());
            assert_eq!(coordinator.settled_count(), 1);
        }

        #[tokio::test]
        async fn rejected_refresh_is_passed_to_the_completion_hook() {
            let server = MockServer::start().await;
            mount_refresh(&server, ResponseTemplate::new(401)).await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert!(matches!(
                outcome,
                RefreshOutcome::Failure(RefreshError::NoUsableTokens)
            ));
            assert_eq!(hooks.completions.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn body_hook_errors_are_surfaced() {
            let server = MockServer::start().await;
            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                Arc::new(FailingBody),
                hooks.clone(),
            );

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert!(matches!(
                outcome,
                RefreshOutcome::Failure(RefreshError::Hook {
                    hook: Hook::FetchBody,
                    ..
                })
            ));
            assert!(server.received_requests().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn completion_hook_errors_are_surfaced() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200).set_body_string("<html>not json</html>"),
            )
            .await;

            let hooks = JsonHooks::new();
            let coordinator = coordinator_for(
                &format!("{}/graphql", server.uri()),
                hooks.clone(),
                hooks.clone(),
            );

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert!(matches!(
                outcome,
                RefreshOutcome::Failure(RefreshError::Hook {
                    hook: Hook::OnRefreshComplete,
                    ..
                })
            ));
        }

        #[tokio::test]
        async fn network_errors_are_surfaced_without_retrying() {
            let hooks = JsonHooks::new();
            let coordinator =
                coordinator_for("http://127.0.0.1:9/graphql", hooks.clone(), hooks.clone());

            let outcome = coordinator.refresh(pair("A1", "R1")).await;

            assert!(matches!(
                outcome,
                RefreshOutcome::Failure(RefreshError::Request(_))
            ));
            assert_eq!(hooks.completions.load(Ordering::SeqCst), 0);
            assert!(!coordinator.is_refreshing());
        }
    }

    mod coordinators {
        use super::*;

        #[tokio::test]
        async fn independent_coordinators_do_not_share_refreshes() {
            let server = MockServer::start().await;
            mount_refresh(
                &server,
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "accessToken": "A2", "refreshToken": "R2" }))
                    .set_delay(Duration::from_millis(100)),
            )
            .await;

            let hooks = JsonHooks::new();
            let url = format!("{}/graphql", server.uri());
            let first = coordinator_for(&url, hooks.clone(), hooks.clone());
            let second = coordinator_for(&url, hooks.clone(), hooks.clone());

            let (a, b) = tokio::join!(
                first.refresh(pair("A1", "R1")),
                second.refresh(pair("A1", "R1"))
            );

            assert!(a.is_success() && b.is_success());
            assert_eq!(server.received_requests().await.unwrap().len(), 2);
        }
    }
}
