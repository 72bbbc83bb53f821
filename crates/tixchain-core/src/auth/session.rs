use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthApi};
use crate::models::{AuthResponse, ProfileUpdate, User};
use crate::storage::{StorageError, TokenStore, CREDENTIAL_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    Loading,
    Authenticated,
    Unauthenticated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Loading => write!(f, "loading"),
            SessionStatus::Authenticated => write!(f, "authenticated"),
            SessionStatus::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

/// What observers see. Status is Authenticated exactly when an identity is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    status: SessionStatus,
    identity: Option<User>,
}

impl SessionSnapshot {
    fn loading() -> Self {
        Self {
            status: SessionStatus::Loading,
            identity: None,
        }
    }

    fn authenticated(user: User) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            identity: Some(user),
        }
    }

    fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            identity: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }
}

/// Result of the startup restore. Never an error: a failed restore just
/// leaves the session unauthenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    NoCredential,
    Restored,
    Failed(RestoreFailure),
}

/// Why a stored credential could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFailure {
    /// The server rejected the credential.
    Expired,
    /// The server could not be reached or was unavailable.
    Unreachable,
    /// The server answered with something that is not a profile.
    Malformed,
    Other,
}

impl From<&ApiError> for RestoreFailure {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => RestoreFailure::Expired,
            ApiError::ServerError(_) | ApiError::RateLimited => RestoreFailure::Unreachable,
            ApiError::Network(_) if err.is_transport() => RestoreFailure::Unreachable,
            ApiError::Network(_) | ApiError::InvalidResponse(_) => RestoreFailure::Malformed,
            ApiError::Rejected(_) | ApiError::NotFound(_) | ApiError::Conflict(_) => {
                RestoreFailure::Other
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to save credential: {0}")]
    Storage(#[from] StorageError),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Profile update has no fields to change")]
    EmptyUpdate,
}

/// Owner of the process-wide session.
///
/// Each operation holds `credential` for its whole duration, including the
/// network call, so operations issued from several tasks run one at a time.
/// Every state change is published to observers as one snapshot.
pub struct SessionStore {
    api: Arc<dyn AuthApi>,
    storage: Arc<dyn TokenStore>,
    credential: Mutex<Option<String>>,
    state: watch::Sender<SessionSnapshot>,
}

impl SessionStore {
    pub fn new(api: Arc<dyn AuthApi>, storage: Arc<dyn TokenStore>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::loading());
        Self {
            api,
            storage,
            credential: Mutex::new(None),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn identity(&self) -> Option<User> {
        self.state.borrow().identity.clone()
    }

    /// The bearer token of the current session, if any.
    pub async fn credential(&self) -> Option<String> {
        self.credential.lock().await.clone()
    }

    /// Restore the session from the stored credential.
    pub async fn initialize(&self) -> RestoreOutcome {
        let mut credential = self.credential.lock().await;

        let stored = match self.storage.get(CREDENTIAL_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        };

        let Some(token) = stored else {
            debug!("No stored credential");
            *credential = None;
            self.publish(SessionSnapshot::unauthenticated());
            return RestoreOutcome::NoCredential;
        };

        match self.api.get_profile(&token).await {
            Ok(user) => {
                info!(user_id = %user.id, "Session restored");
                *credential = Some(token);
                self.publish(SessionSnapshot::authenticated(user));
                RestoreOutcome::Restored
            }
            Err(e) => {
                let reason = RestoreFailure::from(&e);
                warn!(error = %e, ?reason, "Session restore failed, discarding stored credential");
                self.forget_stored();
                *credential = None;
                self.publish(SessionSnapshot::unauthenticated());
                RestoreOutcome::Failed(reason)
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, SessionError> {
        let mut credential = self.credential.lock().await;

        let auth = self.api.login(email, password).await.inspect_err(|e| {
            warn!(error = %e, "Login failed");
        })?;

        let user = self.establish(&mut credential, auth)?;
        info!(user_id = %user.id, "Logged in");
        Ok(user)
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, SessionError> {
        let mut credential = self.credential.lock().await;

        let auth = self.api.register(name, email, password).await.inspect_err(|e| {
            warn!(error = %e, "Registration failed");
        })?;

        let user = self.establish(&mut credential, auth)?;
        info!(user_id = %user.id, "Registered");
        Ok(user)
    }

    /// Drop the session. Never fails; storage errors are only logged.
    pub async fn logout(&self) {
        let mut credential = self.credential.lock().await;
        self.forget_stored();
        *credential = None;
        self.publish(SessionSnapshot::unauthenticated());
        info!("Logged out");
    }

    /// Apply a partial profile change. The server's record replaces the
    /// current identity as a whole.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, SessionError> {
        let credential = self.credential.lock().await;
        let token = credential.as_deref().ok_or(SessionError::NotAuthenticated)?;
        if update.is_empty() {
            return Err(SessionError::EmptyUpdate);
        }

        let user = self.api.update_profile(token, update).await.inspect_err(|e| {
            warn!(error = %e, "Profile update failed");
        })?;

        debug!(user_id = %user.id, "Profile updated");
        self.publish(SessionSnapshot::authenticated(user.clone()));
        Ok(user)
    }

    /// Persist the new credential, then adopt it. Nothing changes if the
    /// credential cannot be stored.
    fn establish(
        &self,
        credential: &mut Option<String>,
        auth: AuthResponse,
    ) -> Result<User, SessionError> {
        self.storage
            .set(CREDENTIAL_KEY, &auth.token)
            .inspect_err(|e| warn!(error = %e, "Failed to persist credential"))?;
        *credential = Some(auth.token);
        self.publish(SessionSnapshot::authenticated(auth.user.clone()));
        Ok(auth.user)
    }

    fn forget_stored(&self) {
        if let Err(e) = self.storage.remove(CREDENTIAL_KEY) {
            warn!(error = %e, "Failed to remove stored credential");
        }
    }

    fn publish(&self, snapshot: SessionSnapshot) {
        self.state.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::storage::MemoryStore;

    /// In-memory backend. Accepts every profile field except `walletAddress`,
    /// which it leaves untouched, like a server that requires a signed
    /// wallet link before changing it.
    #[derive(Default)]
    struct FakeApi {
        accounts: StdMutex<HashMap<String, (String, User)>>,
        tokens: StdMutex<HashMap<String, String>>,
        profile_failure: StdMutex<Option<fn() -> ApiError>>,
        issued: AtomicUsize,
        profile_calls: AtomicUsize,
        update_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeApi {
        fn with_account(email: &str, password: &str, name: &str) -> Self {
            let api = Self::default();
            api.accounts.lock().unwrap().insert(
                email.to_string(),
                (password.to_string(), user(&format!("id-{name}"), name, email)),
            );
            api
        }

        fn fail_profile_with(&self, failure: fn() -> ApiError) {
            *self.profile_failure.lock().unwrap() = Some(failure);
        }

        fn issue_token(&self, email: &str) -> String {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            let token = format!("tok-{n}");
            self.tokens
                .lock()
                .unwrap()
                .insert(token.clone(), email.to_string());
            token
        }

        fn user_for(&self, token: &str) -> Result<User, ApiError> {
            let email = self
                .tokens
                .lock()
                .unwrap()
                .get(token)
                .cloned()
                .ok_or(ApiError::Unauthorized)?;
            let accounts = self.accounts.lock().unwrap();
            Ok(accounts[&email].1.clone())
        }
    }

    #[async_trait]
    impl AuthApi for FakeApi {
        async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
            let user = match self.accounts.lock().unwrap().get(email) {
                Some((stored, user)) if stored == password => user.clone(),
                _ => return Err(ApiError::Unauthorized),
            };
            Ok(AuthResponse {
                token: self.issue_token(email),
                user,
            })
        }

        async fn register(
            &self,
            name: &str,
            email: &str,
            password: &str,
        ) -> Result<AuthResponse, ApiError> {
            let user = {
                let mut accounts = self.accounts.lock().unwrap();
                if accounts.contains_key(email) {
                    return Err(ApiError::Conflict("Email already registered".into()));
                }
                let user = user(&format!("id-{name}"), name, email);
                accounts.insert(email.to_string(), (password.to_string(), user.clone()));
                user
            };
            Ok(AuthResponse {
                token: self.issue_token(email),
                user,
            })
        }

        async fn get_profile(&self, token: &str) -> Result<User, ApiError> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = *self.profile_failure.lock().unwrap() {
                return Err(failure());
            }
            self.user_for(token)
        }

        async fn update_profile(
            &self,
            token: &str,
            update: &ProfileUpdate,
        ) -> Result<User, ApiError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let current = self.user_for(token)?;
            if update.name.as_deref() == Some("") {
                return Err(ApiError::Rejected("name must not be empty".into()));
            }
            let updated = User {
                name: update.name.clone().unwrap_or(current.name),
                username: update.username.clone().or(current.username),
                full_name: update.full_name.clone().or(current.full_name),
                bio: update.bio.clone().or(current.bio),
                avatar_url: update.avatar_url.clone().or(current.avatar_url),
                ..current
            };
            let email = updated.email.clone();
            self.accounts
                .lock()
                .unwrap()
                .get_mut(&email)
                .unwrap()
                .1 = updated.clone();
            Ok(updated)
        }
    }

    /// Storage that refuses every write.
    struct ReadOnlyStore;

    impl TokenStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("read-only")))
        }

        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("read-only")))
        }
    }

    /// Memory storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn fail_writes(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }
    }

    impl TokenStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.check()?;
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.check()?;
            self.inner.remove(key)
        }
    }

    fn user(id: &str, name: &str, email: &str) -> User {
        User {
            id: id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            username: None,
            full_name: None,
            wallet_address: None,
            bio: None,
            avatar_url: None,
            verified: false,
        }
    }

    fn store(api: &Arc<FakeApi>, storage: &Arc<MemoryStore>) -> SessionStore {
        SessionStore::new(api.clone(), storage.clone())
    }

    fn stored_token(storage: &MemoryStore) -> Option<String> {
        storage.get(CREDENTIAL_KEY).unwrap()
    }

    fn assert_consistent(snapshot: &SessionSnapshot) {
        assert_eq!(
            snapshot.status() == SessionStatus::Authenticated,
            snapshot.identity().is_some(),
            "inconsistent snapshot: {snapshot:?}"
        );
    }

    #[tokio::test]
    async fn test_starts_loading() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);

        assert_eq!(session.status(), SessionStatus::Loading);
        assert!(session.identity().is_none());
        assert!(session.credential().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_credential_skips_network() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);

        assert_eq!(session.initialize().await, RestoreOutcome::NoCredential);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_login_then_restart_restores_identity() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());

        let first = store(&api, &storage);
        first.initialize().await;
        let user = first.login("ada@example.com", "pw").await.unwrap();
        assert_eq!(first.status(), SessionStatus::Authenticated);
        assert_eq!(first.identity().as_ref(), Some(&user));
        assert_eq!(first.credential().await, stored_token(&storage));

        // A new process sharing the same durable store.
        let second = store(&api, &storage);
        assert_eq!(second.initialize().await, RestoreOutcome::Restored);
        assert_eq!(second.identity(), Some(user));
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_credential_is_discarded() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::with_credential("stale"));
        let session = store(&api, &storage);

        assert_eq!(
            session.initialize().await,
            RestoreOutcome::Failed(RestoreFailure::Expired)
        );
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(stored_token(&storage), None);
        assert!(session.credential().await.is_none());

        // Second run behaves like a fresh install.
        assert_eq!(session.initialize().await, RestoreOutcome::NoCredential);
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_during_restore() {
        let api = Arc::new(FakeApi::default());
        api.fail_profile_with(|| ApiError::ServerError("bad gateway".into()));
        let storage = Arc::new(MemoryStore::with_credential("tok-0"));
        let session = store(&api, &storage);

        assert_eq!(
            session.initialize().await,
            RestoreOutcome::Failed(RestoreFailure::Unreachable)
        );
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(stored_token(&storage), None);
    }

    #[test]
    fn test_restore_failure_classification() {
        assert_eq!(RestoreFailure::from(&ApiError::Unauthorized), RestoreFailure::Expired);
        assert_eq!(
            RestoreFailure::from(&ApiError::AccessDenied("banned".into())),
            RestoreFailure::Expired
        );
        assert_eq!(RestoreFailure::from(&ApiError::RateLimited), RestoreFailure::Unreachable);
        assert_eq!(
            RestoreFailure::from(&ApiError::InvalidResponse("<html>".into())),
            RestoreFailure::Malformed
        );
        assert_eq!(
            RestoreFailure::from(&ApiError::NotFound("/auth/profile".into())),
            RestoreFailure::Other
        );
    }

    #[tokio::test]
    async fn test_failed_login_leaves_session_untouched() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.initialize().await;
        session.login("ada@example.com", "pw").await.unwrap();

        let before = session.snapshot();
        let token_before = stored_token(&storage);

        let err = session.login("ada@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::Unauthorized)));
        assert_eq!(session.snapshot(), before);
        assert_eq!(stored_token(&storage), token_before);
        assert_eq!(session.credential().await, token_before);
    }

    #[tokio::test]
    async fn test_failed_login_when_logged_out() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.initialize().await;

        assert!(session.login("nobody@example.com", "pw").await.is_err());
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(stored_token(&storage), None);
    }

    #[tokio::test]
    async fn test_register_establishes_new_identity() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.initialize().await;

        let user = session
            .register("grace", "grace@example.com", "pw")
            .await
            .unwrap();
        assert_eq!(user.email, "grace@example.com");
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert!(stored_token(&storage).is_some());

        let before = session.snapshot();
        let err = session
            .register("grace", "grace@example.com", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::Conflict(_))));
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.login("ada@example.com", "pw").await.unwrap();

        session.logout().await;
        let first = session.snapshot();
        assert_eq!(first.status(), SessionStatus::Unauthenticated);
        assert!(first.identity().is_none());
        assert_eq!(stored_token(&storage), None);
        assert!(session.credential().await.is_none());

        session.logout().await;
        assert_eq!(session.snapshot(), first);
        assert_eq!(stored_token(&storage), None);
    }

    #[tokio::test]
    async fn test_logout_from_loading() {
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStore::with_credential("tok-x"));
        let session = store(&api, &storage);

        session.logout().await;
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(stored_token(&storage), None);
    }

    #[tokio::test]
    async fn test_update_profile_takes_server_record() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.login("ada@example.com", "pw").await.unwrap();
        let token_before = stored_token(&storage);

        let update = ProfileUpdate {
            bio: Some("gm".into()),
            wallet_address: Some("0xdeadbeef".into()),
            ..Default::default()
        };
        let user = session.update_profile(&update).await.unwrap();

        assert_eq!(user.bio.as_deref(), Some("gm"));
        // Not echoed back by the server, so not applied locally either.
        assert_eq!(user.wallet_address, None);
        assert_eq!(session.identity(), Some(user));
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(stored_token(&storage), token_before);
    }

    #[tokio::test]
    async fn test_update_profile_failure_keeps_identity() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.login("ada@example.com", "pw").await.unwrap();
        let before = session.snapshot();

        let update = ProfileUpdate {
            name: Some(String::new()),
            ..Default::default()
        };
        let err = session.update_profile(&update).await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::Rejected(_))));
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test]
    async fn test_update_profile_requires_session_and_fields() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.initialize().await;

        let update = ProfileUpdate {
            bio: Some("gm".into()),
            ..Default::default()
        };
        assert!(matches!(
            session.update_profile(&update).await,
            Err(SessionError::NotAuthenticated)
        ));

        session.login("ada@example.com", "pw").await.unwrap();
        assert!(matches!(
            session.update_profile(&ProfileUpdate::default()).await,
            Err(SessionError::EmptyUpdate)
        ));
        assert_eq!(api.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_observers_only_see_consistent_snapshots() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        let mut rx = session.subscribe();
        assert_eq!(rx.borrow_and_update().status(), SessionStatus::Loading);

        session.initialize().await;
        assert!(rx.has_changed().unwrap());
        assert_consistent(&rx.borrow_and_update());

        session.login("ada@example.com", "pw").await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_consistent(&seen);
        assert!(seen.is_authenticated());

        let _ = session.login("ada@example.com", "nope").await;
        assert!(!rx.has_changed().unwrap());

        session
            .update_profile(&ProfileUpdate {
                full_name: Some("Ada Lovelace".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let seen = rx.borrow_and_update().clone();
        assert_consistent(&seen);
        assert_eq!(seen.identity().unwrap().display_name(), "Ada Lovelace");

        session.logout().await;
        let seen = rx.borrow_and_update().clone();
        assert_consistent(&seen);
        assert_eq!(seen.status(), SessionStatus::Unauthenticated);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Initialize,
        Login,
        BadLogin,
        Register,
        DuplicateRegister,
        Logout,
        Update,
        RejectedUpdate,
        EmptyUpdate,
        UnsavableLogin,
    }

    async fn apply(session: &SessionStore, storage: &FlakyStore, op: Op, step: usize) {
        let bio = ProfileUpdate {
            bio: Some(format!("step {step}")),
            ..Default::default()
        };
        match op {
            Op::Initialize => {
                session.initialize().await;
            }
            Op::Login => {
                session.login("ada@example.com", "pw").await.unwrap();
            }
            Op::BadLogin => {
                session.login("ada@example.com", "wrong").await.unwrap_err();
            }
            Op::Register => {
                let email = format!("user{step}@example.com");
                session.register("user", &email, "pw").await.unwrap();
            }
            Op::DuplicateRegister => {
                session.register("ada", "ada@example.com", "pw").await.unwrap_err();
            }
            Op::Logout => session.logout().await,
            Op::Update => {
                let _ = session.update_profile(&bio).await;
            }
            Op::RejectedUpdate => {
                let update = ProfileUpdate {
                    name: Some(String::new()),
                    ..Default::default()
                };
                session.update_profile(&update).await.unwrap_err();
            }
            Op::EmptyUpdate => {
                session
                    .update_profile(&ProfileUpdate::default())
                    .await
                    .unwrap_err();
            }
            Op::UnsavableLogin => {
                storage.fail_writes(true);
                let result = session.login("ada@example.com", "pw").await;
                storage.fail_writes(false);
                assert!(matches!(result, Err(SessionError::Storage(_))));
            }
        }
    }

    #[tokio::test]
    async fn test_state_stays_consistent_across_operation_orders() {
        use Op::*;
        let sequences: &[&[Op]] = &[
            &[Initialize, Login, Update, Logout, Logout, Login],
            &[Login, BadLogin, RejectedUpdate, Initialize, Update, Logout],
            &[Logout, Update, EmptyUpdate, Register, DuplicateRegister, Initialize],
            &[Initialize, UnsavableLogin, Login, UnsavableLogin, Logout, BadLogin],
            &[Register, Logout, Initialize, Login, Register, RejectedUpdate, Update],
            &[UnsavableLogin, EmptyUpdate, Login, Initialize, Logout, Initialize],
        ];

        for (n, ops) in sequences.iter().enumerate() {
            let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
            let storage = Arc::new(FlakyStore::default());
            let session = SessionStore::new(api.clone(), storage.clone());
            let mut rx = session.subscribe();

            for (step, op) in ops.iter().enumerate() {
                apply(&session, &storage, *op, step).await;

                let snapshot = session.snapshot();
                assert_consistent(&snapshot);
                assert_consistent(&rx.borrow_and_update());
                let credential = session.credential().await;
                assert_eq!(
                    credential,
                    storage.get(CREDENTIAL_KEY).unwrap(),
                    "sequence {n} step {step} ({op:?}): memory and storage disagree"
                );
                if snapshot.status() != SessionStatus::Loading {
                    assert_eq!(
                        snapshot.is_authenticated(),
                        credential.is_some(),
                        "sequence {n} step {step} ({op:?}): {snapshot:?}"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_run_one_at_a_time() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(MemoryStore::new());
        let session = store(&api, &storage);
        session.login("ada@example.com", "pw").await.unwrap();

        let first = ProfileUpdate {
            bio: Some("first".into()),
            ..Default::default()
        };
        let second = ProfileUpdate {
            bio: Some("second".into()),
            ..Default::default()
        };
        let (a, b) = tokio::join!(session.update_profile(&first), session.update_profile(&second));
        a.unwrap();
        b.unwrap();

        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
        let bio = session.identity().unwrap().bio;
        assert!(bio.as_deref() == Some("first") || bio.as_deref() == Some("second"));
    }

    #[tokio::test]
    async fn test_login_fails_when_credential_cannot_be_saved() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let session = SessionStore::new(api.clone(), Arc::new(ReadOnlyStore));
        session.initialize().await;
        let before = session.snapshot();

        let err = session.login("ada@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(StorageError::Io(_))));
        assert_eq!(session.snapshot(), before);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(session.credential().await, None);

        let err = session.register("Bob", "bob@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
        assert_eq!(session.snapshot(), before);
        assert_eq!(session.credential().await, None);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_session() {
        let api = Arc::new(FakeApi::with_account("ada@example.com", "pw", "ada"));
        let storage = Arc::new(FlakyStore::default());
        let session = SessionStore::new(api.clone(), storage.clone());
        session.initialize().await;
        session.login("ada@example.com", "pw").await.unwrap();
        let before = session.snapshot();
        let token = session.credential().await;

        storage.fail_writes(true);
        let err = session.login("ada@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(_)));
        assert_eq!(session.snapshot(), before);
        assert_eq!(session.credential().await, token);
        assert_eq!(storage.get(CREDENTIAL_KEY).unwrap(), token);
    }
}
