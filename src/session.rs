//! Authentication state and its binding to the realtime channel.
//!
//! The channel follows the session: logging in connects it for the user,
//! logging out disconnects it, switching users tears the old connection
//! down before the new one comes up.

use lms_shared::SessionUser;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::realtime::RealtimeChannel;
use crate::storage::Storage;

const STORAGE_KEY: &str = "lms_session";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Filled in once the backend confirmed the token
    #[serde(default)]
    pub user: Option<SessionUser>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token,
            user: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}

/// The persisted session blob.
#[derive(Debug, Clone)]
pub struct SessionStore {
    storage: Storage,
}

impl SessionStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn load(&self) -> Option<Session> {
        self.storage
            .load::<Session>(STORAGE_KEY)
            .filter(Session::is_authenticated)
    }

    pub fn save(&self, session: &Session) -> bool {
        self.storage.save(STORAGE_KEY, session)
    }

    pub fn clear(&self) {
        self.storage.remove(STORAGE_KEY);
    }
}

/// Who is logged in, observable through [`AuthState::subscribe`].
#[derive(Debug)]
pub struct AuthState {
    sender: watch::Sender<Option<Session>>,
    store: Option<SessionStore>,
}

impl AuthState {
    pub fn new(store: Option<SessionStore>) -> Self {
        Self::with_session(store, None)
    }

    fn with_session(store: Option<SessionStore>, session: Option<Session>) -> Self {
        let (sender, _) = watch::channel(session);
        Self { sender, store }
    }

    /// Load the persisted session and confirm it with the backend.
    ///
    /// A token the backend rejects (401/403) is forgotten. If the backend
    /// cannot be reached the stored session is kept as is.
    pub async fn restore(store: SessionStore, api: &ApiClient) -> Self {
        let session = match store.load() {
            Some(session) => session,
            None => return Self::new(Some(store)),
        };

        let Some(token) = session.token.clone() else {
            crate::log_debug!("Restored session for {} without a token", session.user_id);
            return Self::with_session(Some(store), Some(session));
        };

        match api.clone().with_token(Some(token)).check_session().await {
            Ok(user) => {
                crate::log_info!("Restored session for {} ({})", user.name, user.id);
                let session = Session {
                    user_id: user.id.clone(),
                    user: Some(user),
                    ..session
                };
                store.save(&session);
                Self::with_session(Some(store), Some(session))
            }
            Err(e) if e.is_unauthorized() => {
                crate::log_warn!("Stored session was rejected: {}", e);
                store.clear();
                Self::new(Some(store))
            }
            Err(e) => {
                crate::log_warn!("Could not verify stored session, keeping it: {}", e);
                Self::with_session(Some(store), Some(session))
            }
        }
    }

    pub fn login(&self, session: Session) {
        if !session.is_authenticated() {
            crate::log_error!("login: session has no user id");
            return;
        }
        if let Some(store) = &self.store {
            if !store.save(&session) {
                crate::log_warn!("login: could not persist session");
            }
        }
        self.sender.send_replace(Some(session));
    }

    pub fn logout(&self) {
        if let Some(store) = &self.store {
            store.clear();
        }
        self.sender.send_replace(None);
    }

    pub fn current(&self) -> Option<Session> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.sender.subscribe()
    }
}

/// Keep `channel` connected for whoever `sessions` says is logged in.
///
/// The task ends (after disconnecting) once the [`AuthState`] is dropped.
pub fn bind_channel(
    channel: RealtimeChannel,
    mut sessions: watch::Receiver<Option<Session>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut bound: Option<String> = None;
        loop {
            let current = sessions.borrow_and_update().clone();
            follow(&channel, &mut bound, current);
            if sessions.changed().await.is_err() {
                break;
            }
        }
        if bound.is_some() || channel.user_id().is_some() {
            channel.disconnect();
        }
        crate::log_debug!("Session binding stopped");
    })
}

fn follow(channel: &RealtimeChannel, bound: &mut Option<String>, session: Option<Session>) {
    match session.filter(Session::is_authenticated) {
        Some(session) => {
            if bound.as_deref().is_some_and(|user| user != session.user_id) {
                crate::log_info!("Session switched users; resetting realtime channel");
                channel.disconnect();
            }
            // Bound even if the open fails; the channel still holds the user
            *bound = Some(session.user_id.clone());
            if channel.connect_session(&session).is_none() {
                crate::log_warn!("Realtime channel did not start for {}", session.user_id);
            }
        }
        None => {
            let was_bound = bound.take().is_some();
            if was_bound || channel.user_id().is_some() {
                crate::log_info!("Logged out; disconnecting realtime channel");
                channel.disconnect();
            }
        }
    }
}
