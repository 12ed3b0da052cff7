//! objstore-fs daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use objstore_fs::auth::identity::IdentityConfig;
use objstore_fs::auth::{AuthProvider, CatalogCache, IdentityProvider, StaticTokenProvider};
use objstore_fs::config::{Backend, Config, Credentials, MountConfig, StoreConfig};
use objstore_fs::mount::MountManager;
use objstore_fs::store::{ObjectStorage, StoreContext};
use objstore_fs::transport::http::HttpTransportConfig;
use objstore_fs::transport::{HttpTransport, MemoryTransport, Transport};
use objstore_fs::vfs::{SessionOptions, StoreFs};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: objstore-fs <config.yaml>");
    eprintln!();
    eprintln!("objstore-fs - Mount object-storage containers as a filesystem");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  objstore-fs /etc/objstore-fs/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("objstore-fs starting");
    info!("Loaded configuration from {:?}", config_path);

    let storage = match connect(&config.store).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to connect to the object store: {}", e);
            std::process::exit(1);
        }
    };

    let manager = Arc::new(MountManager::new());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let m = manager.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
        m.unmount_all();
    })?;

    for mount_config in &config.mounts {
        info!("Setting up mount at {:?}", mount_config.path);

        if !mount_config.path.exists() {
            debug!("Creating mount point directory {:?}", mount_config.path);
            if let Err(e) = std::fs::create_dir_all(&mount_config.path) {
                error!(
                    "Failed to create mount point {:?}: {}",
                    mount_config.path, e
                );
                continue;
            }
        }

        let fs = Arc::new(filesystem(&storage, mount_config));
        if let Err(e) = manager.mount(mount_config.path.clone(), fs) {
            error!("Failed to mount {:?}: {}", mount_config.path, e);
            continue;
        }
    }

    if manager.count() == 0 {
        error!("No filesystems were mounted successfully");
        std::process::exit(1);
    }

    info!("{} filesystem(s) mounted successfully", manager.count());
    info!("Press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Shutting down");
    manager.unmount_all();
    info!("All filesystems unmounted, exiting");

    Ok(())
}

/// Authenticate and bind to the account's storage endpoint
async fn connect(store: &StoreConfig) -> objstore_fs::Result<ObjectStorage> {
    if store.backend == Backend::Memory {
        info!("Using the in-memory store; contents are lost on exit");
        let transport = Arc::new(MemoryTransport::new());
        return Ok(ObjectStorage::new(StoreContext::new(
            transport.endpoint().to_string(),
            "local",
            transport,
        )));
    }

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(HttpTransportConfig {
        timeout: store.timeout,
        ..Default::default()
    })?);

    let provider: Arc<dyn AuthProvider> = match &store.credentials {
        Credentials::Token { token, endpoint } => {
            let provider = StaticTokenProvider::new(token.clone(), endpoint.clone());
            match &store.region {
                Some(region) => Arc::new(provider.with_region(region.clone())),
                None => Arc::new(provider),
            }
        }
        Credentials::Password {
            identity_url,
            username,
            password,
            tenant_id,
            tenant_name,
        } => Arc::new(IdentityProvider::new(
            IdentityConfig {
                identity_url: identity_url.clone(),
                username: username.clone(),
                password: password.clone(),
                tenant_id: tenant_id.clone(),
                tenant_name: tenant_name.clone(),
            },
            transport.clone(),
        )),
        Credentials::Local => {
            return Err(objstore_fs::StoreError::Configuration(
                "The http backend needs credentials".to_string(),
            ))
        }
    };

    let storage = ObjectStorage::authenticate(
        provider,
        CatalogCache::global(),
        store.region.as_deref(),
        transport,
    )
    .await?;

    let info = storage.account_info().await?;
    info!(
        "Account holds {} container(s), {} object(s), {} bytes",
        info.containers, info.objects, info.bytes
    );

    Ok(storage)
}

/// Build the filesystem for one mount
fn filesystem(storage: &ObjectStorage, mount: &MountConfig) -> StoreFs {
    StoreFs::new(
        storage.with_content_verification(mount.verify_content),
        mount.container.clone(),
    )
    .with_session_options(SessionOptions {
        never_write: mount.never_write,
        content_type: mount.content_type.clone(),
    })
    .with_read_only(mount.read_only)
}
