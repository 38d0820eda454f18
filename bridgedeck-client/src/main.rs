use std::path::PathBuf;

use bridgedeck_client::{
    Console, ConsoleEvent, NoticeLevel, PairingArtifact,
    client_state::{ClientStateStore, client_state_path},
    config::{ConsoleConfig, resolve_state_dir},
    connection::normalize_phone,
    token_store::TOKEN_QUERY_PARAM,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "bridgedeck", about = "Headless console for messaging-gateway instances")]
struct RunnerArgs {
    #[arg(long, env = "BRIDGEDECK_BASE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// Credential to sign in with. Takes priority over the saved one.
    #[arg(long, env = "BRIDGEDECK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Instance to select after loading; defaults to the saved selection.
    #[arg(long)]
    instance: Option<String>,

    /// Directory holding client_state.json (also BRIDGEDECK_STATE_DIR).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Connect the selected instance after start-up.
    #[arg(long, default_value_t = false)]
    connect: bool,

    /// Request a QR code for the selected instance.
    #[arg(long, default_value_t = false, conflicts_with = "pair_phone")]
    qr: bool,

    /// Request a linking code for this phone number.
    #[arg(long)]
    pair_phone: Option<String>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = RunnerArgs::parse();
    init_logging(args.debug);

    let mut config = match ConsoleConfig::from_base_url(&args.base_url) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };
    if let Some(token) = args.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let mut navigation = config.base_url.clone();
        navigation
            .query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, token);
        config = config.with_navigation_url(navigation);
    }
    if let Some(phone) = args.pair_phone.as_deref()
        && let Err(err) = normalize_phone(phone)
    {
        error!("{err}");
        std::process::exit(2);
    }

    let state_path = client_state_path(&resolve_state_dir(args.state_dir.as_deref()));
    info!(path = %state_path.display(), base_url = %config.base_url, "runner starting");
    let client_state = ClientStateStore::open(state_path);

    let (console, events) = match Console::new(config, client_state) {
        Ok(pair) => pair,
        Err(err) => {
            error!("failed to start console: {err}");
            std::process::exit(1);
        }
    };
    let printer = tokio::spawn(print_events(events));

    if let Err(err) = run(&console, &args).await {
        error!("{err}");
        console.shutdown();
        printer.abort();
        std::process::exit(1);
    }

    info!("running; press Ctrl+C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {err}");
    }
    console.shutdown();
    printer.abort();
}

async fn run(console: &Console, args: &RunnerArgs) -> Result<(), bridgedeck_client::ApiError> {
    let scope = console.sign_in().await?;
    info!(?scope, "session ready");

    let instances = console.load_instances().await?;
    for instance in &instances {
        info!(instance_id = %instance.id, name = %instance.name, state = %instance.state, "instance");
    }

    if let Some(id) = args.instance.as_deref() {
        console.select_instance(id).await?;
    }
    if args.connect {
        console.connect().await?;
    }
    if args.qr {
        console.request_qr().await?;
    }
    if let Some(phone) = args.pair_phone.as_deref() {
        console.request_linking_code(phone).await?;
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ConsoleEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConsoleEvent::SignedIn { scope } => info!(?scope, "signed in"),
            ConsoleEvent::SelectionChanged { instance_id } => {
                info!(instance_id = instance_id.as_deref().unwrap_or("-"), "selection changed");
            }
            ConsoleEvent::StateChanged {
                instance_id,
                previous,
                current,
            } => info!(%instance_id, %previous, %current, "state changed"),
            ConsoleEvent::Notice { level, message } => match level {
                NoticeLevel::Info => info!("{message}"),
                NoticeLevel::Warning => warn!("{message}"),
                NoticeLevel::Error => error!("{message}"),
            },
            ConsoleEvent::PairingArtifact {
                instance_id,
                artifact,
            } => match artifact {
                PairingArtifact::QrCode { data_uri, image } => {
                    info!(%instance_id, bytes = image.len(), "QR code ready");
                    println!("{data_uri}");
                }
                PairingArtifact::LinkingCode(code) => {
                    info!(%instance_id, "linking code ready");
                    println!("{code}");
                }
                PairingArtifact::AlreadyPaired => info!(%instance_id, "already paired"),
            },
            ConsoleEvent::ReauthenticationRequired => {
                warn!("credential no longer valid; sign in again with --token");
            }
        }
    }
}

fn init_logging(debug: bool) {
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if debug {
        for directive in ["bridgedeck=debug", "bridgedeck_client=debug", "bridgedeck_core=debug"] {
            if let Ok(directive) = directive.parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
