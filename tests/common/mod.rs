//! Shared fixtures: in-memory collaborators and a wired session manager
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use uuid::Uuid;

use session_keeper::auth::{Caller, TokenIssuer};
use session_keeper::clients::{
    MailClient, NewUser, PermissionDto, RoleClient, RoleDto, User, UserRepository,
};
use session_keeper::configuration::{JwtSettings, PurposeTokenSettings};
use session_keeper::error::{ExternalError, RepositoryError};
use session_keeper::purpose_token::PurposeTokenService;
use session_keeper::session_manager::{AuthSessionManager, Registration};
use session_keeper::startup::run;
use session_keeper::store::{Keyspace, KeyspacePurposeTokenStore, KeyspaceSessionStore};

pub const PASSWORD: &str = "Sup3rSecret9";
pub const ACCESS_TTL: i64 = 900;

// ============================================================================
// Users
// ============================================================================

#[derive(Default)]
pub struct InMemoryUsers {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUsers {
    pub fn get(&self, id: Uuid) -> Option<User> {
        self.users.lock().unwrap().get(&id).cloned()
    }

    pub fn ban(&self, id: Uuid) {
        if let Some(user) = self.users.lock().unwrap().get_mut(&id) {
            user.is_banned = true;
        }
    }

    /// Remove behind the manager's back, as another service would
    pub fn remove(&self, id: Uuid) {
        self.users.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl UserRepository for InMemoryUsers {
    async fn find_by_emails(&self, emails: &[String]) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.lock().unwrap();
        Ok(users
            .values()
            .filter(|u| emails.contains(&u.email))
            .cloned()
            .collect())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.lock().unwrap();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn create(&self, user: &NewUser) -> Result<User, RepositoryError> {
        let mut users = self.users.lock().unwrap();
        if users
            .values()
            .any(|u| u.email == user.email || u.username == user.username)
        {
            return Err(RepositoryError::Conflict("user already exists".to_string()));
        }
        let created = User {
            id: Uuid::new_v4(),
            email: user.email.clone(),
            username: user.username.clone(),
            password_hash: user.password_hash.clone(),
            is_banned: false,
            email_verified: false,
            created_at: Utc::now(),
        };
        users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.users.lock().unwrap().remove(&id).is_some())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), RepositoryError> {
        match self.users.lock().unwrap().get_mut(&id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<(), RepositoryError> {
        match self.users.lock().unwrap().get_mut(&id) {
            Some(user) => {
                user.email_verified = true;
                Ok(())
            }
            None => Err(RepositoryError::NotFound(id.to_string())),
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

#[derive(Default)]
pub struct FakeRoles {
    roles: Mutex<HashMap<Uuid, Vec<RoleDto>>>,
    removed: Mutex<Vec<Uuid>>,
    gate: Mutex<Option<Arc<Barrier>>>,
    pub fail_get: AtomicBool,
    pub fail_default: AtomicBool,
    pub fail_remove: AtomicBool,
}

impl FakeRoles {
    /// Add a role carrying `codes` to the user
    pub fn grant(&self, user_id: Uuid, codes: &[&str]) {
        let role = RoleDto {
            id: Uuid::new_v4(),
            name: "support".to_string(),
            permissions: codes
                .iter()
                .map(|code| PermissionDto {
                    id: Uuid::new_v4(),
                    code: code.to_string(),
                })
                .collect(),
        };
        self.roles
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(role);
    }

    pub fn removed(&self) -> Vec<Uuid> {
        self.removed.lock().unwrap().clone()
    }

    pub fn set(&self, flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    /// Hold every role lookup until `parties` callers are waiting
    pub fn gate(&self, parties: usize) {
        *self.gate.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }
}

fn unavailable() -> ExternalError {
    ExternalError::ServiceUnavailable("role".to_string())
}

#[async_trait]
impl RoleClient for FakeRoles {
    async fn get_user_roles(&self, user_id: Uuid) -> Result<Vec<RoleDto>, ExternalError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self
            .roles
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_user_roles(&self, user_id: Uuid) -> Result<(), ExternalError> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.roles.lock().unwrap().remove(&user_id);
        self.removed.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn set_user_as_default(&self, user_id: Uuid) -> Result<(), ExternalError> {
        if self.fail_default.load(Ordering::SeqCst) {
            return Err(ExternalError::Transport("role".to_string(), "connection refused".to_string()));
        }
        self.grant(user_id, &[]);
        Ok(())
    }
}

// ============================================================================
// Mail
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailKind {
    EmailVerification,
    ForgotPassword,
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub kind: MailKind,
    pub recipient: String,
    pub token: String,
}

#[derive(Default)]
pub struct RecordingMail {
    sent: Mutex<Vec<SentMail>>,
    pub fail: AtomicBool,
}

impl RecordingMail {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    /// Token of the most recent mail of `kind` sent to `recipient`
    pub fn last_token(&self, kind: MailKind, recipient: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.kind == kind && m.recipient == recipient)
            .map(|m| m.token)
    }

    fn record(&self, kind: MailKind, recipient: &str, token: &str) -> Result<(), ExternalError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Timeout("mail".to_string()));
        }
        self.sent.lock().unwrap().push(SentMail {
            kind,
            recipient: recipient.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl MailClient for RecordingMail {
    async fn send_email_verification(&self, recipient: &str, token: &str) -> Result<(), ExternalError> {
        self.record(MailKind::EmailVerification, recipient, token)
    }

    async fn send_forgot_password(&self, recipient: &str, token: &str) -> Result<(), ExternalError> {
        self.record(MailKind::ForgotPassword, recipient, token)
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn jwt_settings() -> JwtSettings {
    JwtSettings {
        algorithm: "HS256".to_string(),
        secret: Some("integration-test-secret-0123456789abcdef".to_string()),
        private_key_pem: None,
        public_key_pem: None,
        issuer: "session-keeper-test".to_string(),
        access_token_expiry: ACCESS_TTL,
        refresh_token_expiry: 604800,
    }
}

pub fn purpose_token_settings() -> PurposeTokenSettings {
    PurposeTokenSettings {
        email_verification_expiry: 86400,
        reset_password_expiry: 1800,
        login_expiry: 300,
        general_expiry: 3600,
    }
}

pub struct Harness {
    pub keyspace: Arc<Keyspace>,
    pub sessions: Arc<KeyspaceSessionStore>,
    pub users: Arc<InMemoryUsers>,
    pub roles: Arc<FakeRoles>,
    pub mail: Arc<RecordingMail>,
    pub issuer: TokenIssuer,
    pub manager: Arc<AuthSessionManager>,
}

impl Harness {
    pub fn new() -> Self {
        let keyspace = Arc::new(Keyspace::new());
        let sessions = Arc::new(KeyspaceSessionStore::new(keyspace.clone()));
        let users = Arc::new(InMemoryUsers::default());
        let roles = Arc::new(FakeRoles::default());
        let mail = Arc::new(RecordingMail::default());
        let issuer = TokenIssuer::from_settings(&jwt_settings()).expect("Failed to build issuer");
        let manager = Arc::new(build_manager(&keyspace, &sessions, &users, &roles, &mail, &issuer));

        Self {
            keyspace,
            sessions,
            users,
            roles,
            mail,
            issuer,
            manager,
        }
    }

    /// A second manager over the same state, for handing to the HTTP server
    pub fn detached_manager(&self) -> AuthSessionManager {
        build_manager(
            &self.keyspace,
            &self.sessions,
            &self.users,
            &self.roles,
            &self.mail,
            &self.issuer,
        )
    }

    pub async fn register(&self, email: &str, username: &str) -> User {
        self.manager
            .register(&Registration {
                email: email.to_string(),
                username: username.to_string(),
                password: PASSWORD.to_string(),
                display_name: None,
            })
            .await
            .expect("Failed to register user")
    }

    pub async fn login(&self, email: &str, device: &str) -> String {
        self.manager
            .login(email, PASSWORD, device)
            .await
            .expect("Failed to log in")
            .access_token
    }

    pub fn caller(&self, access_token: &str) -> Caller {
        let claims = self
            .issuer
            .validate_access(access_token)
            .expect("Access token should be valid");
        Caller::from_claims(&claims)
    }
}

fn build_manager(
    keyspace: &Arc<Keyspace>,
    sessions: &Arc<KeyspaceSessionStore>,
    users: &Arc<InMemoryUsers>,
    roles: &Arc<FakeRoles>,
    mail: &Arc<RecordingMail>,
    issuer: &TokenIssuer,
) -> AuthSessionManager {
    let tokens = PurposeTokenService::new(
        Arc::new(KeyspacePurposeTokenStore::new(keyspace.clone())),
        purpose_token_settings(),
    );
    AuthSessionManager::new(
        sessions.clone(),
        tokens,
        users.clone(),
        roles.clone(),
        mail.clone(),
        issuer.clone(),
    )
}

pub struct TestApp {
    pub address: String,
    pub harness: Harness,
}

pub fn spawn_app() -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let harness = Harness::new();

    let server = run(listener, harness.detached_manager()).expect("Failed to create server");
    let _ = tokio::spawn(server);

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        harness,
    }
}
