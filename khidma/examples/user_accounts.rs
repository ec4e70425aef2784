//! A user-accounts service wired through Khidma.
//!
//! Each simulated request runs in its own scope: the scoped `DbContext`
//! stages writes and commits them when the scope is disposed. The engine
//! and the context factory are singletons; services are transient.
//!
//! Run with `RUST_LOG=debug cargo run -p khidma --example user_accounts`
//! to see resolutions and disposals.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use khidma::logging::init_tracing;
use khidma::prelude::{
    AsyncDispose, BoxError, Container, ContainerBuilder, Context, Injectable, Provider, Recipe,
};
use tokio::sync::Mutex;
use tracing::info;

// === Infrastructure stand-ins ===

struct Settings {
    database_url: String,
}

/// In-memory table shared by every session.
struct Engine {
    url: String,
    users: Mutex<BTreeMap<u64, User>>,
}

struct DbContextFactory {
    engine: Arc<Engine>,
}

impl Injectable for DbContextFactory {
    type Deps = (Arc<Engine>,);

    fn construct((engine,): Self::Deps) -> Result<Self, BoxError> {
        Ok(DbContextFactory { engine })
    }
}

impl DbContextFactory {
    fn create(&self) -> DbContext {
        info!(url = %self.engine.url, "Session opened");
        DbContext {
            engine: self.engine.clone(),
            staged: Mutex::new(Vec::new()),
        }
    }
}

/// One unit of work. Writes become visible on commit.
struct DbContext {
    engine: Arc<Engine>,
    staged: Mutex<Vec<User>>,
}

impl DbContext {
    async fn add(&self, user: User) {
        self.staged.lock().await.push(user);
    }

    async fn get(&self, id: u64) -> Option<User> {
        self.engine.users.lock().await.get(&id).cloned()
    }

    async fn all(&self) -> Vec<User> {
        self.engine.users.lock().await.values().cloned().collect()
    }

    async fn next_id(&self) -> u64 {
        let committed = self.engine.users.lock().await.len() as u64;
        let staged = self.staged.lock().await.len() as u64;
        committed + staged + 1
    }
}

#[async_trait]
impl AsyncDispose for DbContext {
    async fn dispose(&self) -> Result<(), BoxError> {
        let staged = std::mem::take(&mut *self.staged.lock().await);
        let mut users = self.engine.users.lock().await;
        for user in &staged {
            users.insert(user.id, user.clone());
        }
        info!(committed = staged.len(), "Session closed");
        Ok(())
    }
}

// === Domain ===

#[derive(Debug, Clone)]
struct User {
    id: u64,
    email: String,
    password_hash: String,
}

trait PasswordManager: Send + Sync {
    fn hash_password(&self, password: &str) -> String;
    fn verify_password(&self, password: &str, hash: &str) -> bool;
}

/// Not a real hash. Password hashing is out of scope for this demo.
struct ReversingPasswordManager;

impl PasswordManager for ReversingPasswordManager {
    fn hash_password(&self, password: &str) -> String {
        format!("rev${}", password.chars().rev().collect::<String>())
    }

    fn verify_password(&self, password: &str, hash: &str) -> bool {
        self.hash_password(password) == hash
    }
}

impl Injectable for ReversingPasswordManager {
    type Deps = ();

    fn construct(_: ()) -> Result<Self, BoxError> {
        Ok(ReversingPasswordManager)
    }
}

#[async_trait]
trait UserService: Send + Sync {
    async fn create_user(&self, email: &str, password: &str) -> User;
    async fn get_user(&self, id: u64) -> Option<User>;
    async fn get_all_users(&self) -> Vec<User>;
}

struct DbUserService {
    db: Arc<DbContext>,
    passwords: Arc<dyn PasswordManager>,
}

impl Injectable for DbUserService {
    type Deps = (Arc<DbContext>, Arc<dyn PasswordManager>);

    fn construct((db, passwords): Self::Deps) -> Result<Self, BoxError> {
        Ok(DbUserService { db, passwords })
    }
}

#[async_trait]
impl UserService for DbUserService {
    async fn create_user(&self, email: &str, password: &str) -> User {
        let user = User {
            id: self.db.next_id().await,
            email: email.to_string(),
            password_hash: self.passwords.hash_password(password),
        };
        self.db.add(user.clone()).await;
        user
    }

    async fn get_user(&self, id: u64) -> Option<User> {
        self.db.get(id).await
    }

    async fn get_all_users(&self) -> Vec<User> {
        self.db.all().await
    }
}

// === Wiring ===

struct DatabaseProvider;

impl Provider for DatabaseProvider {
    fn register(&self, builder: &mut ContainerBuilder) -> khidma::Result<()> {
        builder
            .register_singleton(Recipe::<Engine>::factory_with(|(settings,): (Arc<Settings>,)| {
                Ok(Arc::new(Engine {
                    url: settings.database_url.clone(),
                    users: Mutex::new(BTreeMap::new()),
                }))
            }))?
            .register_singleton(Recipe::<DbContextFactory>::construct())?
            .register_scoped(
                Recipe::<DbContext>::factory_with(|(factory,): (Arc<DbContextFactory>,)| {
                    Ok(Arc::new(factory.create()))
                })
                .async_disposable(),
            )?;
        Ok(())
    }
}

struct AccountsProvider;

impl Provider for AccountsProvider {
    fn register(&self, builder: &mut ContainerBuilder) -> khidma::Result<()> {
        builder
            .register_transient(Recipe::<dyn PasswordManager>::bind(
                |manager: Arc<ReversingPasswordManager>| -> Arc<dyn PasswordManager> { manager },
            ))?
            .register_transient(Recipe::<dyn UserService>::bind(
                |service: Arc<DbUserService>| -> Arc<dyn UserService> { service },
            ))?;
        Ok(())
    }
}

fn build_container() -> khidma::Result<Container> {
    let mut builder = Container::builder();
    builder
        .register_singleton(Recipe::value(Settings {
            database_url: "memory://accounts".into(),
        }))?
        .add_provider(&DatabaseProvider)?
        .add_provider(&AccountsProvider)?;
    builder.build()
}

// === "Controllers" ===

#[derive(Debug, Clone)]
struct SignupRequest {
    email: String,
    password: String,
}

async fn create_user(request: Context<SignupRequest>, users: Arc<dyn UserService>) -> User {
    users.create_user(&request.email, &request.password).await
}

async fn list_users(_: Context<()>, users: Arc<dyn UserService>) -> Vec<User> {
    users.get_all_users().await
}

#[tokio::main]
async fn main() -> khidma::Result<()> {
    init_tracing("info");

    let container = build_container()?;

    for (email, password) in [("ada@example.com", "lovelace"), ("alan@example.com", "turing")] {
        let request = SignupRequest {
            email: email.into(),
            password: password.into(),
        };

        let user = container
            .in_scope(|scope| async move {
                scope
                    .injector()
                    .wrap(create_user)
                    .call_async(request)
                    .await
            })
            .await?;
        info!(id = user.id, email = %user.email, "User created");
    }

    let users = container
        .in_scope(|scope| async move {
            scope.injector().wrap(list_users).call_async(()).await
        })
        .await?;
    info!(count = users.len(), "Listed users");

    let passwords = container.resolve::<dyn PasswordManager>().await?;
    for user in &users {
        let hint = if user.email.starts_with("ada") { "lovelace" } else { "turing" };
        info!(
            email = %user.email,
            verified = passwords.verify_password(hint, &user.password_hash),
            "Password check"
        );
    }

    let scope = container.create_scope();
    let service = scope.resolve::<dyn UserService>().await?;
    match service.get_user(42).await {
        Some(user) => info!(?user, "Found"),
        None => info!(id = 42, "User not found"),
    }
    scope.dispose().await?;

    // Scoped services need a scope.
    if let Err(err) = container.resolve::<DbContext>().await {
        info!("Expected failure:\n{err}");
    }

    container.shutdown().await
}
