//! Identity sessions.
//!
//! The delivery controller never signs anyone in; it only asks for the current
//! credential and listens for the session ending.

use crate::error::DeliveryError;
use crate::model::Credential;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// A token this close to expiry is treated as already expired.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);
/// Refresh at most this long before expiry (half the remaining lifetime for short tokens).
const REFRESH_LEAD: Duration = Duration::from_secs(300);
const MIN_REFRESH_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Session {
    pub email: Option<String>,
    pub credential: Credential,
    pub expires_at: Option<Instant>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() + EXPIRY_SKEW >= at)
            .unwrap_or(false)
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Bearer credential of the signed-in session, if it is still valid.
    fn current_credential(&self) -> Option<Credential>;

    /// Session changes; `None` means signed out.
    fn subscribe(&self) -> watch::Receiver<Option<Session>>;

    /// End the current session. Subscribers observe `None`.
    fn sign_out(&self);
}

/// Current session slot shared by identity implementations.
struct SessionSlot {
    tx: watch::Sender<Option<Session>>,
}

impl SessionSlot {
    fn new(initial: Option<Session>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    fn credential(&self) -> Option<Credential> {
        let session = self.tx.borrow();
        match session.as_ref() {
            Some(s) if !s.is_expired() => Some(s.credential.clone()),
            Some(_) => {
                tracing::debug!("session token expired");
                None
            }
            None => None,
        }
    }

    fn expires_at(&self) -> Option<Instant> {
        self.tx.borrow().as_ref().and_then(|s| s.expires_at)
    }

    fn replace(&self, session: Option<Session>) {
        self.tx.send_replace(session);
    }
}

/// A pre-issued bearer token, for scripting and tests.
pub struct StaticIdentity {
    slot: SessionSlot,
}

impl StaticIdentity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            slot: SessionSlot::new(Some(Session {
                email: None,
                credential: Credential::new(token),
                expires_at: None,
            })),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            slot: SessionSlot::new(None),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_credential(&self) -> Option<Credential> {
        self.slot.credential()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.slot.tx.subscribe()
    }

    fn sign_out(&self) {
        self.slot.replace(None);
    }
}

/// Email/password sessions against the hosted identity REST API.
///
/// A signed-in session's id token is refreshed in the background shortly before it
/// expires. When it cannot be refreshed the session ends at expiry and subscribers
/// observe `None`.
pub struct FirebaseIdentity {
    client: Arc<IdentityClient>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

struct IdentityClient {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    token_url: String,
    slot: SessionSlot,
    // Refresh token of the published session; cleared on sign-out.
    refresh_token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

// The token endpoint answers in snake_case.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityErrorBody {
    error: IdentityErrorDetail,
}

#[derive(Debug, Deserialize)]
struct IdentityErrorDetail {
    message: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `{base}/{method}?key={api_key}` with the key query-encoded.
fn keyed_url(base: &str, method: &str, api_key: &str) -> Result<reqwest::Url, DeliveryError> {
    let mut url = reqwest::Url::parse(&format!("{}/{}", base.trim_end_matches('/'), method))
        .map_err(|e| DeliveryError::Transport(format!("Invalid identity URL {base}: {e}")))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

fn expiry(expires_in: Option<&str>) -> Option<Instant> {
    expires_in
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| Instant::now() + Duration::from_secs(secs))
}

impl FirebaseIdentity {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self::with_base_url(http, api_key, IDENTITY_TOOLKIT_URL)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self::with_urls(http, api_key, base_url, SECURE_TOKEN_URL)
    }

    /// Sign-in and token refresh endpoints both overridden.
    pub fn with_urls(
        http: reqwest::Client,
        api_key: impl Into<String>,
        identity_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            client: Arc::new(IdentityClient {
                http,
                api_key: api_key.into(),
                identity_url: identity_url.into(),
                token_url: token_url.into(),
                slot: SessionSlot::new(None),
                refresh_token: Mutex::new(None),
            }),
            refresher: Mutex::new(None),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, DeliveryError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(DeliveryError::Validation(
                "Please enter both email and password".to_string(),
            ));
        }

        let client = &self.client;
        let url = keyed_url(&client.identity_url, "accounts:signInWithPassword", &client.api_key)?;
        let req = client.http.post(url).json(&serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        }));
        let mut parsed: SignInResponse = client.call(req, "Sign-in").await?;

        let refresh_token = parsed.refresh_token.take();
        let session = session_from_sign_in(parsed, email);
        tracing::info!(email = ?session.email, "signed in");
        self.install(session.clone(), refresh_token);
        Ok(session)
    }

    /// Publish a new session and restart the background refresher for it.
    fn install(&self, session: Session, refresh_token: Option<String>) {
        let mut refresher = lock(&self.refresher);
        if let Some(task) = refresher.take() {
            task.abort();
        }
        self.client.store(Some(session), refresh_token);
        *refresher = Some(tokio::spawn(keep_fresh(self.client.clone())));
    }
}

impl Drop for FirebaseIdentity {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.refresher).take() {
            task.abort();
        }
    }
}

impl IdentityClient {
    async fn call<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, DeliveryError> {
        let resp = req
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("{what} request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| DeliveryError::Transport(format!("{what} request failed: {e}")))?;

        if !status.is_success() {
            let reason = serde_json::from_slice::<IdentityErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| format!("{what} failed with HTTP {status}"));
            return Err(DeliveryError::Auth(reason));
        }

        serde_json::from_slice(&body).map_err(|e| {
            DeliveryError::Transport(format!("Malformed {} response: {e}", what.to_lowercase()))
        })
    }

    fn store(&self, session: Option<Session>, refresh_token: Option<String>) {
        let mut current = lock(&self.refresh_token);
        *current = refresh_token;
        self.slot.replace(session);
    }

    /// Exchange the refresh token for a new id token and publish the renewed session.
    async fn refresh(&self) -> Result<(), DeliveryError> {
        let Some(used) = lock(&self.refresh_token).clone() else {
            return Err(DeliveryError::Auth("Session cannot be refreshed".to_string()));
        };
        let url = keyed_url(&self.token_url, "token", &self.api_key)?;
        let req = self.http.post(url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", used.as_str()),
        ]);
        let resp: RefreshResponse = self.call(req, "Token refresh").await?;

        let mut current = lock(&self.refresh_token);
        // Signed out (or in again) while the request was in flight.
        if current.as_deref() != Some(used.as_str()) {
            return Ok(());
        }
        let email = self.slot.tx.borrow().as_ref().and_then(|s| s.email.clone());
        *current = Some(resp.refresh_token.unwrap_or(used));
        self.slot.replace(Some(Session {
            email,
            credential: Credential::new(resp.id_token),
            expires_at: expiry(resp.expires_in.as_deref()),
        }));
        tracing::debug!("identity token refreshed");
        Ok(())
    }

    /// End the session that expires at `expires_at`, unless it was replaced meanwhile.
    fn expire(&self, expires_at: Instant) {
        let mut current = lock(&self.refresh_token);
        if self.slot.expires_at() != Some(expires_at) {
            return;
        }
        *current = None;
        self.slot.replace(None);
        tracing::info!("session expired");
    }
}

/// Refresh the published session ahead of its expiry until that stops working.
async fn keep_fresh(client: Arc<IdentityClient>) {
    loop {
        let Some(expires_at) = client.slot.expires_at() else {
            return;
        };
        let remaining = expires_at.saturating_duration_since(Instant::now());
        let lead = REFRESH_LEAD.min(remaining / 2);
        let wait = remaining.saturating_sub(lead).max(MIN_REFRESH_WAIT);
        tokio::time::sleep(wait).await;

        if let Err(e) = client.refresh().await {
            tracing::warn!(error = %e, "could not refresh the identity token");
            let unusable_at = expires_at.checked_sub(EXPIRY_SKEW).unwrap_or(expires_at);
            tokio::time::sleep_until(unusable_at.into()).await;
            client.expire(expires_at);
            return;
        }
    }
}

fn session_from_sign_in(resp: SignInResponse, email: &str) -> Session {
    Session {
        email: Some(resp.email.unwrap_or_else(|| email.to_string())),
        credential: Credential::new(resp.id_token),
        expires_at: expiry(resp.expires_in.as_deref()),
    }
}

impl IdentityProvider for FirebaseIdentity {
    fn current_credential(&self) -> Option<Credential> {
        self.client.slot.credential()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.client.slot.tx.subscribe()
    }

    fn sign_out(&self) {
        if let Some(task) = lock(&self.refresher).take() {
            task.abort();
        }
        self.client.store(None, None);
        tracing::info!("signed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Form, Query};
    use axum::http::StatusCode;
    use axum::routing::{post, MethodRouter};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    const KEY: &str = "k&y =1";
    const SIGN_IN: &str = "/v1/accounts:signInWithPassword";
    const TOKEN: &str = "/v1/token";

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1")
    }

    fn rejected(message: &str) -> (StatusCode, Json<serde_json::Value>) {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": message}})),
        )
    }

    fn sign_in_route(expires_in: &'static str) -> MethodRouter {
        post(move |Query(q): Query<HashMap<String, String>>| async move {
            if q.get("key").map(String::as_str) != Some(KEY) {
                return rejected("API_KEY_INVALID");
            }
            (
                StatusCode::OK,
                Json(json!({
                    "idToken": "first",
                    "refreshToken": "r1",
                    "expiresIn": expires_in,
                    "email": "a@b.c"
                })),
            )
        })
    }

    fn refresh_route() -> MethodRouter {
        post(
            |Query(q): Query<HashMap<String, String>>,
             Form(f): Form<HashMap<String, String>>| async move {
                let ok = q.get("key").map(String::as_str) == Some(KEY)
                    && f.get("grant_type").map(String::as_str) == Some("refresh_token")
                    && f.get("refresh_token").map(String::as_str) == Some("r1");
                if !ok {
                    return rejected("INVALID_REFRESH_TOKEN");
                }
                (
                    StatusCode::OK,
                    Json(json!({"id_token": "fresh", "refresh_token": "r2", "expires_in": "3600"})),
                )
            },
        )
    }

    #[test]
    fn static_identity_signs_out() {
        let id = StaticIdentity::new("tok");
        let mut rx = id.subscribe();
        assert_eq!(id.current_credential(), Some(Credential::new("tok")));
        id.sign_out();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
        assert_eq!(id.current_credential(), None);
    }

    #[test]
    fn expired_session_has_no_credential() {
        let slot = SessionSlot::new(Some(Session {
            email: None,
            credential: Credential::new("old"),
            expires_at: Some(Instant::now() + Duration::from_secs(5)),
        }));
        assert_eq!(slot.credential(), None);
    }

    #[test]
    fn sign_in_response_sets_expiry() {
        let resp: SignInResponse = serde_json::from_str(
            r#"{"idToken": "abc", "expiresIn": "3600", "localId": "u1"}"#,
        )
        .unwrap();
        let session = session_from_sign_in(resp, "a@b.c");
        assert_eq!(session.email.as_deref(), Some("a@b.c"));
        assert!(!session.is_expired());
        assert!(session.expires_at.is_some());
    }

    #[tokio::test]
    async fn sign_in_requires_both_fields() {
        let id = FirebaseIdentity::new(reqwest::Client::new(), "key");
        let err = id.sign_in("", "pw").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[test]
    fn keyed_url_encodes_api_key() {
        let url = keyed_url("http://localhost/v1/", "token", KEY).unwrap();
        assert_eq!(url.as_str(), "http://localhost/v1/token?key=k%26y+%3D1");
    }

    #[tokio::test]
    async fn sign_in_rejection_is_auth_error() {
        let base = serve(Router::new().route(SIGN_IN, sign_in_route("3600"))).await;
        let id = FirebaseIdentity::with_urls(reqwest::Client::new(), "wrong", &base, &base);
        let err = id.sign_in("a@b.c", "pw").await.unwrap_err();
        assert_eq!(err, DeliveryError::Auth("API_KEY_INVALID".into()));
        assert!(id.subscribe().borrow().is_none());
    }

    #[tokio::test]
    async fn session_is_refreshed_before_expiry() {
        let app = Router::new()
            .route(SIGN_IN, sign_in_route("2"))
            .route(TOKEN, refresh_route());
        let base = serve(app).await;
        let id = FirebaseIdentity::with_urls(reqwest::Client::new(), KEY, &base, &base);
        let mut rx = id.subscribe();

        let session = id.sign_in("a@b.c", "pw").await.unwrap();
        assert_eq!(session.credential, Credential::new("first"));

        let fresh = Credential::new("fresh");
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.as_ref().is_some_and(|s| s.credential == fresh)),
        )
        .await
        .expect("token refreshed in time")
        .unwrap();
        assert_eq!(id.current_credential(), Some(fresh));
        assert_eq!(rx.borrow().as_ref().and_then(|s| s.email.clone()).as_deref(), Some("a@b.c"));
        assert_eq!(lock(&id.client.refresh_token).as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn unrefreshable_session_ends_at_expiry() {
        let app = Router::new()
            .route(SIGN_IN, sign_in_route("2"))
            .route(TOKEN, post(|| async { rejected("TOKEN_EXPIRED") }));
        let base = serve(app).await;
        let id = FirebaseIdentity::with_urls(reqwest::Client::new(), KEY, &base, &base);
        let mut rx = id.subscribe();

        id.sign_in("a@b.c", "pw").await.unwrap();
        assert!(rx.borrow_and_update().is_some());

        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(Option::is_none))
            .await
            .expect("expiry published as sign-out")
            .unwrap();
        assert_eq!(id.current_credential(), None);
    }

    #[tokio::test]
    async fn sign_out_stops_refreshing() {
        let app = Router::new()
            .route(SIGN_IN, sign_in_route("2"))
            .route(TOKEN, refresh_route());
        let base = serve(app).await;
        let id = FirebaseIdentity::with_urls(reqwest::Client::new(), KEY, &base, &base);

        id.sign_in("a@b.c", "pw").await.unwrap();
        id.sign_out();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(id.subscribe().borrow().is_none());
        assert_eq!(lock(&id.client.refresh_token).as_deref(), None);
    }
}
