use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rsocket_prototype::hello::{HelloRequest, HelloRequests, HelloResponse};
use rsocket_prototype::ids::{IdGenerator, RandomIds};
use rsocket_prototype::rsocket_lite::{
    ClientIdentity, CompletionTracker, ConnectConfig, ConnectionEvent, ConnectionManager,
    InteractionDispatcher, SessionConfig, TlsConfig, TransportConfig, TransportKind, TrustConfig,
    WaitOutcome,
};
use rsocket_prototype::{CHANNEL_BATCH_SIZE, DEFAULT_HOST, DEFAULT_PORT, DEMO_METADATA};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid {name} value '{value}'")),
        Err(_) => Ok(default),
    }
}

/// Trust defaults to accepting any certificate unless a CA bundle is given.
fn tls_from_env() -> TlsConfig {
    let ca = env::var("RSOCKET_CA").ok();
    let insecure = match env::var("RSOCKET_INSECURE") {
        Ok(value) => value == "1" || value.eq_ignore_ascii_case("true"),
        Err(_) => ca.is_none(),
    };

    let trust = match ca {
        _ if insecure => TrustConfig::InsecureTrustAll,
        Some(ca) => TrustConfig::TrustStore(ca.into()),
        None => TrustConfig::NativeRoots,
    };

    let identity = match (env::var("RSOCKET_CERT"), env::var("RSOCKET_KEY")) {
        (Ok(cert_chain), Ok(private_key)) => Some(ClientIdentity::Pem {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
        }),
        _ => None,
    };

    TlsConfig {
        trust,
        identity,
        server_name: None,
    }
}

fn log_response(interaction: &'static str) -> impl FnMut(HelloResponse) + Send + 'static {
    move |response| {
        info!(
            interaction,
            id = %response.id,
            value = %response.value,
            "Received response"
        );
    }
}

fn report(interaction: &str, outcome: WaitOutcome, tracker: &CompletionTracker) {
    match outcome {
        WaitOutcome::Completed if tracker.failures() == 0 => {
            info!(interaction, "Interaction complete")
        }
        outcome => warn!(
            interaction,
            ?outcome,
            failures = tracker.failures(),
            "Interaction ended early"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let host = env::var("RSOCKET_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = env_or("RSOCKET_PORT", DEFAULT_PORT)?;
    let kind = env_or("RSOCKET_TRANSPORT", TransportKind::Tls)?;
    let batches = env_or("RSOCKET_CHANNEL_BATCHES", 300usize)?;
    let pacing = Duration::from_millis(env_or("RSOCKET_PACING_MS", 1000u64)?);

    let tls = tls_from_env();
    info!(
        host = %host,
        port,
        transport = %kind,
        insecure = kind.is_secure() && tls.is_insecure(),
        "Client connecting"
    );

    let config = ConnectConfig::builder()
        .transport(
            TransportConfig::builder()
                .host(host.clone())
                .port(port)
                .kind(kind)
                .tls(tls)
                .build(),
        )
        .session(SessionConfig::default())
        .build();

    let mut manager = ConnectionManager::new();
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::ResumptionRejected { token, attempt }) => {
                    warn!(token = %token, attempt, "Session rejected, reconnecting")
                }
                Ok(event) => info!(?event, "Connection event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed connection events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let connection = manager
        .connect(config)
        .await
        .context("failed to connect")?;
    let dispatcher = InteractionDispatcher::new(connection);
    let mut ids = RandomIds::new();

    dispatcher.metadata_push(DEMO_METADATA).await?;
    info!(metadata = DEMO_METADATA, "Metadata pushed");

    dispatcher.fire_and_forget(&HelloRequest::new("1")).await?;
    info!("Fire-and-forget sent");

    let tracker = CompletionTracker::new(1);
    dispatcher.request_response(
        &HelloRequest::new("1"),
        &tracker,
        log_response("request-response"),
    )?;
    report("request-response", tracker.wait().await, &tracker);

    let stream_ids = ids.generate(5);
    let tracker = CompletionTracker::new(stream_ids.len());
    dispatcher.request_stream(
        &HelloRequests::new(stream_ids),
        &tracker,
        log_response("request-stream"),
    )?;
    report("request-stream", tracker.wait().await, &tracker);

    let requests: Vec<_> = (0..batches)
        .map(|_| HelloRequests::new(ids.generate(CHANNEL_BATCH_SIZE)))
        .collect();
    let tracker = CompletionTracker::new(batches * CHANNEL_BATCH_SIZE);
    dispatcher.request_channel(
        requests,
        pacing,
        &tracker,
        log_response("request-channel"),
    )?;
    report("request-channel", tracker.wait().await, &tracker);

    manager.shutdown().await;
    info!("Client finished");
    Ok(())
}
