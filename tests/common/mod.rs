//! Common test utilities for integration tests.
//!
//! `memory` holds Docker-free fakes. `MongoTestContainer` shares a single
//! MongoDB 7.0 container per test binary (each `tests/*.rs` file is its own
//! binary) and isolates tests by suffixing database names with a short UUID.
//!
//! The container runs on a dedicated thread with its own tokio runtime so it
//! outlives the per-test `#[tokio::test]` runtimes; an `atexit` hook removes it.

#![allow(dead_code)]

pub mod memory;
pub mod transport;

use mongodb::{Client, options::ClientOptions};
use std::sync::OnceLock;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mongo::Mongo;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static SHARED_URI: OnceLock<String> = OnceLock::new();

/// Docker container ID, kept globally for the `atexit` cleanup hook.
static CONTAINER_ID: OnceLock<String> = OnceLock::new();

unsafe extern "C" {
    fn atexit(f: extern "C" fn()) -> i32;
}

extern "C" fn remove_container() {
    if let Some(id) = CONTAINER_ID.get() {
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", id])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
}

fn shared_uri() -> &'static str {
    SHARED_URI.get_or_init(|| {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to create container runtime");

            rt.block_on(async {
                let container = Mongo::default()
                    .with_tag("7.0")
                    .start()
                    .await
                    .expect("Failed to start MongoDB container");

                let _ = CONTAINER_ID.set(container.id().to_string());
                unsafe {
                    atexit(remove_container);
                }

                let host = container.get_host().await.expect("Failed to get host");
                let port = container.get_host_port_ipv4(27017).await.expect("Failed to get port");
                let uri = format!("mongodb://{}:{}/?directConnection=true", host, port);

                let opts = ClientOptions::parse(&uri).await.expect("Failed to parse");
                let probe = Client::with_options(opts).expect("Failed to create probe client");
                for _ in 0..30 {
                    if probe.list_database_names().await.is_ok() {
                        break;
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
                drop(probe);

                tx.send(uri).expect("Failed to send connection string");

                // Keep the container alive until the process exits.
                std::future::pending::<()>().await;
            });
        });

        rx.recv().expect("Failed to receive connection string")
    })
}

/// Handle to the shared container with a per-test database namespace.
pub struct MongoTestContainer {
    pub client: Client,
    pub connection_string: String,
    test_id: String,
}

impl MongoTestContainer {
    pub async fn start() -> Self {
        let connection_string = shared_uri().to_string();
        let client_options =
            ClientOptions::parse(&connection_string).await.expect("Failed to parse connection string");
        let client = Client::with_options(client_options).expect("Failed to create client");
        let test_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        Self { client, connection_string, test_id }
    }

    pub fn db_name(&self, name: &str) -> String {
        format!("{}_{}", name, self.test_id)
    }

    pub fn collection(&self, db: &str, collection: &str) -> mongodb::Collection<mongodb::bson::Document> {
        self.client.database(&self.db_name(db)).collection(collection)
    }
}
