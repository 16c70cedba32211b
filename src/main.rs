use chatcall::bus::{InMemorySignalBus, SignalBus};
use chatcall::callcore::fsm::{ActiveCall, CallUpdate};
use chatcall::callcore::types::{CallId, CallType, GroupId, UserId};
use chatcall::callcore::CallError;
use chatcall::controller::CallObserver;
use chatcall::directory::InMemoryDirectory;
use chatcall::media::{LoopbackFactory, LoopbackNetwork, LoopbackScript};
use chatcall::notify::InMemoryNotificationCenter;
use chatcall::registry::CallRegistry;
use chatcall::{CallConfig, ClientSession};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Simulates a one-to-one call and a group call between in-process users.
//
// Usage:
//   cargo run                              # defaults
//   cargo run -- --config calls.json       # override timings / token settings
//   cargo run -- --ring-only               # let the personal call go unanswered

#[derive(Parser, Debug)]
#[command(name = "chatcall", about = "In-process call signaling demo")]
struct Args {
    /// JSON file overriding `CallConfig` defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Leave the personal call unanswered and watch it time out.
    #[arg(long)]
    ring_only: bool,
}

struct LogObserver {
    user: UserId,
}

impl CallObserver for LogObserver {
    fn on_incoming_call(&self, call: &ActiveCall) {
        let from = call.peer.as_ref().map(|p| p.name.as_str()).unwrap_or("?");
        info!("[{}] incoming {} call from {}", self.user, call.kind, from);
    }

    fn on_call_updated(&self, update: &CallUpdate) {
        match update {
            CallUpdate::Finished {
                call_id,
                status,
                reason,
                duration_seconds,
            } => info!(
                "[{}] call {} finished: {} ({:?}, {:?}s)",
                self.user, call_id, status, reason, duration_seconds
            ),
            other => info!("[{}] {:?}", self.user, other),
        }
    }

    fn on_media_failed(&self, call_id: &CallId, error: &CallError) {
        warn!("[{}] no media for {}: {}", self.user, call_id, error);
    }
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let outcome = rt.block_on(async {
        tokio::select! {
            outcome = run(args) => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, exiting");
                Ok(())
            }
        }
    });
    if let Err(e) = outcome {
        error!("demo failed: {e:?}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => CallConfig::from_json_file(path)?,
        None => CallConfig::default(),
    };

    let directory = InMemoryDirectory::new();
    directory.add_user("alice", "Alice");
    directory.add_user("bob", "Bob");
    directory.add_user("carol", "Carol");
    directory.add_group("team", "Team", &["alice", "bob", "carol"]);

    let bus: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
    let registry = CallRegistry::new(
        config.clone(),
        bus.clone(),
        Arc::new(InMemoryNotificationCenter::new()),
        Arc::new(directory),
    );
    let network = LoopbackNetwork::new();

    let session = |name: &str| {
        let user = UserId::new(name);
        let session = ClientSession::in_process(
            &config,
            user.clone(),
            registry.clone(),
            bus.clone(),
            Arc::new(LoopbackFactory::new(network.clone(), LoopbackScript::new())),
            Arc::new(LogObserver { user }),
        );
        session.start();
        session
    };
    let alice = session("alice");
    let bob = session("bob");
    let carol = session("carol");

    info!("--- personal call: alice -> bob ---");
    let receipt = alice
        .personal()
        .invite(UserId::new("bob"), CallType::Voice)
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    if args.ring_only {
        tokio::time::sleep(config.ring_timeout() + Duration::from_secs(1)).await;
    } else {
        bob.personal().accept(&receipt.call_id).await?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        info!(
            "alice hears {:?}, bob hears {:?}",
            alice.personal().media().subscribed().await,
            bob.personal().media().subscribed().await
        );
        alice.personal().hang_up().await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("--- group call: alice -> team ---");
    let receipt = alice
        .group()
        .invite(GroupId::new("team"), CallType::Voice)
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    bob.group().accept(&receipt.call_id).await?;
    carol.group().decline(&receipt.call_id).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    bob.group().leave().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for session in [&alice, &bob, &carol] {
        for call in registry.history_for(session.user_id()).await {
            info!(
                "history {}: {} {} {} reason={:?} duration={:?}",
                session.user_id(),
                call.id,
                call.kind,
                call.status,
                call.reason,
                call.duration_seconds
            );
        }
        session.shutdown().await;
    }
    Ok(())
}
