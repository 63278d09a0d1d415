//! Hello service and client on an in-process bus.
//!
//! Runs a `ServiceLifecycle` and (unless `--req 0` without `--sub`) a
//! `HelloClient` against each other until Ctrl+C, until `--duration` expires,
//! or until the client is done with its requests.
//!
//! Run with:
//! ```bash
//! cargo run --bin hello_demo -- --sub --req 3 --timers 1s:1,10ms:1
//! TOGGLE_OFFER=1 DEBUG=1 cargo run --bin hello_demo -- --sub
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hello_someip::config::{parse_u16, DEFAULT_FLAP_PERIOD, DEFAULT_TIMERS};
use hello_someip::prelude::*;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SOME/IP Hello service and client demo", long_about = None)]
struct Args {
    /// Application name of the service
    #[arg(long, env = "NAME", default_value = "hello_service")]
    service_name: String,

    /// Application name of the client
    #[arg(long, default_value = "hello_client")]
    client_name: String,

    /// Timer specification, e.g. "1m:1,1s:1,10ms:0,1ms:0"
    #[arg(long, env = "TIMERS", default_value = DEFAULT_TIMERS)]
    timers: String,

    /// Log verbosity: 0 = info, 1 = debug, 2+ = trace (RUST_LOG overrides)
    #[arg(long, env = "DEBUG", default_value_t = 0)]
    debug: u8,

    /// Non-zero suppresses per-request and per-event output
    #[arg(long, env = "QUIET", default_value_t = 0)]
    quiet: u8,

    /// Non-zero toggles offer/stop-offer every --flap-period seconds
    #[arg(long, env = "TOGGLE_OFFER", default_value_t = 0)]
    toggle_offer: u8,

    #[arg(long, default_value_t = DEFAULT_FLAP_PERIOD.as_secs())]
    flap_period: u64,

    /// Non-zero rejects every second subscription
    #[arg(long, env = "TOGGLE_ACK", default_value_t = 0)]
    toggle_ack: u8,

    /// Non-zero broadcasts 1 ms events back to back instead of running timers
    #[arg(long, env = "NO_TIMERS", default_value_t = 0)]
    no_timers: u8,

    /// Warn when a timer callback takes longer (microseconds, 0 = off)
    #[arg(long, env = "TIMER_CB_US", default_value_t = 0)]
    timer_cb_us: u64,

    #[arg(long, env = "UP_SERVICE", default_value = "0x6000", value_parser = parse_u16)]
    service: u16,

    #[arg(long, env = "UP_INSTANCE", default_value = "0x0001", value_parser = parse_u16)]
    instance: u16,

    #[arg(long, env = "UP_SERVICE_MAJOR", default_value_t = 1)]
    major: u8,

    #[arg(long, env = "UP_SERVICE_MINOR", default_value_t = 0)]
    minor: u32,

    #[arg(long, env = "UP_METHOD", default_value = "0x8001", value_parser = parse_u16)]
    method: u16,

    #[arg(long, env = "UP_EVENTGROUP", default_value = "0x0100", value_parser = parse_u16)]
    eventgroup: u16,

    #[arg(long, env = "UP_EVENT", default_value = "0x8005", value_parser = parse_u16)]
    event: u16,

    /// Comma-separated alternate service ids also offered
    #[arg(long, env = "UP_SERVICES", value_delimiter = ',', value_parser = parse_u16)]
    services: Vec<u16>,

    /// Service the client looks for (0xFFFF = any); defaults to --service
    #[arg(long, value_parser = parse_u16)]
    client_service: Option<u16>,

    /// Instance the client looks for (0xFFFF = any); defaults to --instance
    #[arg(long, value_parser = parse_u16)]
    client_instance: Option<u16>,

    /// Subscribe the client to the timer events
    #[arg(long)]
    sub: bool,

    /// Number of requests the client sends
    #[arg(long, default_value_t = 1)]
    req: u32,

    /// Request text
    #[arg(long, default_value = "World")]
    message: String,

    /// Pause between requests (ms)
    #[arg(long, env = "DELAY", default_value_t = 0)]
    delay: u64,

    /// Report event deltas deviating at least this much from the interval (ms, 0 = off)
    #[arg(long, env = "DELTA", default_value_t = 0)]
    delta: u64,

    /// Response timeout (ms)
    #[arg(long, default_value_t = 5000)]
    timeout: u64,

    /// Request/response string layout: raw or length-prefixed
    #[arg(long, default_value = "raw")]
    profile: WireProfile,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
}

fn init_tracing(debug: u8) {
    let level = match debug {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();
}

fn service_config(args: &Args) -> ServiceConfig {
    ServiceConfig::builder()
        .service_id(args.service)
        .instance_id(args.instance)
        .major(args.major)
        .minor(args.minor)
        .method_id(args.method)
        .eventgroup_id(args.eventgroup)
        .event_id(args.event)
        .alternate_services(args.services.iter().copied())
        .profile(args.profile)
        .timers(TimerConfig::parse_lossy(&args.timers))
        .tight_loop(args.no_timers != 0)
        .flapping((args.toggle_offer != 0).then(|| Duration::from_secs(args.flap_period)))
        .toggle_ack(args.toggle_ack != 0)
        .callback_budget((args.timer_cb_us > 0).then(|| Duration::from_micros(args.timer_cb_us)))
        .build()
}

fn client_config(args: &Args) -> ClientConfig {
    ClientConfig::builder()
        .service(args.client_service.unwrap_or(args.service))
        .instance(args.client_instance.unwrap_or(args.instance))
        .major(args.major)
        .method_id(args.method)
        .eventgroup_id(args.eventgroup)
        .event_id(args.event)
        .profile(args.profile)
        .subscribe_events(args.sub)
        .request_count(args.req)
        .message(args.message.clone())
        .request_delay(Duration::from_millis(args.delay))
        .request_timeout(Duration::from_millis(args.timeout))
        .max_delta((args.delta > 0).then(|| Duration::from_millis(args.delta)))
        .quiet(args.quiet != 0)
        .build()
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Forward every SIGINT/SIGTERM to the service.
async fn forward_signals(service: ServiceLifecycle) {
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("cannot listen for Ctrl+C: {e}");
                    return;
                }
            }
            () = terminate() => {}
        }
        info!("signal received, shutting down");
        service.shutdown_request();
    }
}

async fn run(args: Args) -> Result<()> {
    let bus = LoopbackBus::new();

    let service = ServiceLifecycle::new(service_config(&args), Arc::new(bus.endpoint(args.service_name.clone())));
    service.init()?;
    service.start();
    let signals = tokio::spawn(forward_signals(service.clone()));

    let client = if args.req > 0 || args.sub {
        let client = HelloClient::new(client_config(&args), Arc::new(bus.endpoint(args.client_name.clone())));
        client.init()?;
        client.start();
        Some(client)
    } else {
        None
    };

    let client_done = async {
        match &client {
            Some(client) if !args.sub => client.wait_stopped().await,
            _ => std::future::pending().await,
        }
    };
    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        () = service.wait_stopped() => {}
        () = client_done => info!("client finished"),
        () = deadline => info!("duration elapsed"),
    }

    if let Some(client) = &client {
        client.stop().await;
    }
    service.shutdown_request();
    service.wait_stopped().await;
    signals.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
