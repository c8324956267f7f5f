use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{error, info, warn};
use taskroom::app::App;
use taskroom::config::Config;
use taskroom::server;
use taskroom::store::MemoryStore;

/// Checks that the PEM files hold at least one certificate and a private key.
fn validate_tls(cert_path: &Path, key_path: &Path) -> Result<(), String> {
    let cert_file = File::open(cert_path)
        .map_err(|e| format!("Failed to open certificate file {}: {e}", cert_path.display()))?;
    let key_file = File::open(key_path)
        .map_err(|e| format!("Failed to open private key file {}: {e}", key_path.display()))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to parse certificate: {e}"))?;
    if certs.is_empty() {
        return Err(format!("No certificate found in {}", cert_path.display()));
    }

    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(format!("No private key found in {}", key_path.display())),
        Err(e) => Err(format!("Failed to parse private key: {e}")),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let addr = config.bind_addr;
    let tls = match (config.tls_cert_path.clone(), config.tls_key_path.clone()) {
        (Some(cert), Some(key)) => match validate_tls(&cert, &key) {
            Ok(()) => Some((cert, key)),
            Err(e) => {
                warn!("{}; falling back to HTTP/WS", e);
                None
            }
        },
        (None, None) => None,
        _ => {
            warn!("TLS_CERT_PATH and TLS_KEY_PATH must be set together; falling back to HTTP/WS");
            None
        }
    };

    let app = App::new(config, MemoryStore::new());
    let jobs = app.start_background().await;
    let routes = server::routes(app.server());

    match tls {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {}", addr);
            let (_, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, shutdown_signal());
            serving.await;
        }
        None => match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown_signal()) {
            Ok((bound, serving)) => {
                info!("Starting server (HTTP/WS) on {}", bound);
                serving.await;
            }
            Err(e) => error!("Failed to bind {}: {}", addr, e),
        },
    }

    app.shutdown(jobs).await;
}
