use clap::Parser;
use ldapd::api::{self, ApiState};
use ldapd::config::{load_tls_acceptor, Opts};
use ldapd::mfa::{MfaExchange, MultifactorApi};
use ldapd::serve::LdapServer;
use ldapd::store::{DirectoryStore, MemoryStore};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(opts: Opts) -> Result<(), u8> {
    if let Some(uri) = &opts.postgres_uri {
        // the relational store is an external implementation of the store
        // contract; refusing beats silently ignoring the DSN
        error!(uri = %uri, "POSTGRES_URI is set but no relational store is linked in");
        return Err(EXIT_CONFIG);
    }

    let tls_acceptor = match (&opts.ssl_cert, &opts.ssl_key) {
        (Some(cert), Some(key)) => {
            match load_tls_acceptor(
                cert,
                key,
                opts.ssl_chain.as_deref(),
                opts.ssl_ca.as_deref(),
            ) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(error = %e, "cannot load TLS material");
                    return Err(EXIT_CONFIG);
                }
            }
        }
        (None, None) => None,
        _ => {
            error!("SSL_CERT and SSL_KEY must be set together");
            return Err(EXIT_CONFIG);
        }
    };
    if opts.use_core_tls && tls_acceptor.is_none() {
        error!("USE_CORE_TLS requires SSL_CERT and SSL_KEY");
        return Err(EXIT_CONFIG);
    }

    let config = Arc::new(opts.server_config());
    let store: Arc<dyn DirectoryStore> = Arc::new(MemoryStore::new(&opts.base_dn));
    let mfa_exchange = Arc::new(MfaExchange::new());
    let mfa_api = opts
        .mfa_api_uri
        .as_ref()
        .map(|uri| Arc::new(MultifactorApi::new(uri.clone())));

    let ldap_listener = match TcpListener::bind((opts.host, opts.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(host = %opts.host, port = opts.port, error = %e, "cannot bind LDAP listener");
            return Err(EXIT_BIND);
        }
    };
    let http_listener = match TcpListener::bind((opts.http_host, opts.http_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(host = %opts.http_host, port = opts.http_port, error = %e, "cannot bind HTTP listener");
            return Err(EXIT_BIND);
        }
    };

    info!(host = %opts.host, port = opts.port, ldaps = opts.use_core_tls, "serving ldap");
    info!(host = %opts.http_host, port = opts.http_port, "serving multifactor side channel");

    let server = Arc::new(LdapServer {
        store: store.clone(),
        config: config.clone(),
        mfa_exchange: mfa_exchange.clone(),
        mfa_api: mfa_api.clone(),
        tls_acceptor,
        ldaps: opts.use_core_tls,
    });
    tokio::spawn(server.serve(ldap_listener));

    let api_state = Arc::new(ApiState {
        store,
        config,
        mfa_exchange,
        mfa_api,
    });
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, api::router(api_state)).await {
            error!(error = %e, "http side channel failed");
        }
    });

    wait_for_shutdown().await;
    info!("shutting down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
