use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::{Error, Result};

const MAX_REDIRECTS: usize = 5;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared client used by the poll-image prober.
///
/// No request timeout is set on the client; every probe is bounded by its
/// own budget instead.
pub fn build_probe_client(user_agent: &str, pool_max_idle_per_host: usize) -> Result<reqwest::Client> {
    install_rustls_provider();

    reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(30))
        // Cameras routinely ship self-signed certificates.
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
