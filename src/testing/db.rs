//! Test database setup using testcontainers for PostgreSQL.

use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use crate::init::init_tracker_db;
use crate::pool::{create_pool, Pool, PoolConfig};

/// Global PostgreSQL container shared across all tests.
///
/// Starting the container once and handing each test its own database keeps
/// the suite fast while preserving isolation.
static POSTGRES_CONTAINER: OnceCell<ContainerAsync<Postgres>> = OnceCell::const_new();

async fn container_url() -> String {
    let container = POSTGRES_CONTAINER
        .get_or_init(|| async {
            Postgres::default()
                .start()
                .await
                .expect("Failed to start PostgreSQL container")
        })
        .await;
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");
    format!("postgres://postgres:postgres@{}:{}", host, port)
}

/// Generate a unique database name for test isolation.
fn unique_db_name() -> String {
    format!("test_db_{}", uuid::Uuid::new_v4().simple())
}

fn admin_pool_config() -> PoolConfig {
    PoolConfig {
        max_connections: 2,
        min_connections: 1,
        acquire_timeout_secs: 30,
        max_lifetime_secs: None,
        idle_timeout_secs: None,
    }
}

/// An isolated, migrated database inside the shared container.
///
/// The database is dropped when the `TestDb` is dropped.
pub(crate) struct TestDb {
    pub(crate) pool: Pool,
    db_name: String,
    admin_pool: Pool,
}

/// Installs a subscriber honoring `RUST_LOG`; repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestDb {
    pub(crate) async fn new() -> TestDb {
        init_tracing();
        let url = container_url().await;

        let admin_pool = create_pool(&format!("{url}/postgres"), &admin_pool_config())
            .await
            .expect("admin pool");

        let db_name = unique_db_name();
        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name))
            .execute(&admin_pool)
            .await
            .expect("create test database");

        let pool = create_pool(
            &format!("{url}/{db_name}"),
            &PoolConfig {
                max_connections: 5,
                min_connections: 1,
                acquire_timeout_secs: 30,
                max_lifetime_secs: None,
                idle_timeout_secs: None,
            },
        )
        .await
        .expect("test pool");

        init_tracker_db(&pool).await.expect("migrations");

        TestDb {
            pool,
            db_name,
            admin_pool,
        }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        // Drop is synchronous; hand the cleanup to the test's runtime if one
        // is still alive, otherwise let the container's teardown reclaim it.
        let db_name = self.db_name.clone();
        let admin_pool = self.admin_pool.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = sqlx::query(&format!(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}'",
                    db_name
                ))
                .execute(&admin_pool)
                .await;
                let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", db_name))
                    .execute(&admin_pool)
                    .await;
            });
        }
    }
}
