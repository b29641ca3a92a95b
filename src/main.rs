use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use twinlink::codec::WINNER_PLAYER;
use twinlink::{
    Config, ControlPort, EndOfLevel, Error, LeaseServer, LevelShape, Link, Result, Role, Session,
    Snapshot, SyncMessage, bridge,
};

#[derive(Parser)]
#[command(name = "twinlink")]
#[command(author, version, about = "Two-device game link: lease server, session and sync", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Give up if the session is not established within this many seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Level whose shape frames the first snapshots
    #[arg(long, default_value_t = 1)]
    level: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve leases and accept the joining device
    Host,
    /// Connect to the hosting device
    Join,
    ShowConfig,
    ListLevels,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.as_ref().unwrap_or(&Commands::Host) {
        Commands::Host => {
            info!("Hosting with config: {:?}", cli.config);
            let mut server = LeaseServer::new(config.clone()).await?;
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let lease_task = tokio::spawn(async move {
                tokio::select! {
                    result = server.run() => {
                        if let Err(error) = result {
                            error!("Lease server stopped: {}", error);
                        }
                    }
                    _ = stop_rx => {}
                }
                server.shutdown();
            });

            let result = run_peer(Role::Acceptor, &config, &cli).await;

            let _ = stop_tx.send(());
            if let Err(error) = lease_task.await {
                warn!("Lease server task failed: {}", error);
            }
            result
        }
        Commands::Join => {
            info!("Joining {}:{}", config.peer_address, config.session_port);
            run_peer(Role::Connector, &config, &cli).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLevels => {
            println!("{:<8} {:<8} {:<8} {:<10}", "Level", "Coins", "Enemies", "Snapshot");
            println!("{}", "-".repeat(36));
            for level in 1..=LevelShape::level_count() {
                if let Some(shape) = LevelShape::for_level(level) {
                    println!(
                        "{:<8} {:<8} {:<8} {:<10}",
                        level,
                        shape.coins(),
                        shape.enemies(),
                        format!("{} bytes", shape.snapshot_len())
                    );
                }
            }
            Ok(())
        }
    }
}

async fn run_peer(role: Role, config: &Config, cli: &Cli) -> Result<()> {
    let shape = LevelShape::for_level(cli.level)
        .ok_or_else(|| Error::InvalidShape(format!("no level {}", cli.level)))?;

    let mut session = Session::open(role, config)?;

    tokio::select! {
        result = establish(&mut session, cli.connect_timeout) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal before the peer connected");
            session.close().await;
            return Ok(());
        }
    }

    let (control, network) = bridge::channel();
    let control_thread = spawn_control(
        control,
        cli.level,
        shape,
        Duration::from_millis(config.tick_millis),
    )?;

    let link = Link::new(
        session,
        network,
        shape,
        Duration::from_millis(config.poll_millis),
    );

    tokio::select! {
        result = link.run() => {
            let stats = result?;
            info!("Session ended after {} sent / {} received", stats.sent, stats.received);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping link...");
        }
    }

    match tokio::task::spawn_blocking(move || control_thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!("Control thread panicked"),
        Err(error) => error!("Failed to join control thread: {}", error),
    }
    Ok(())
}

async fn establish(session: &mut Session, timeout_secs: Option<u64>) -> Result<()> {
    let Some(secs) = timeout_secs else {
        return session.establish().await;
    };

    match tokio::time::timeout(Duration::from_secs(secs), session.establish()).await {
        Ok(result) => result,
        Err(_) => {
            session.close().await;
            Err(Error::Socket(format!(
                "Session not established within {}s",
                secs
            )))
        }
    }
}

/// Headless stand-in for the game loop: publishes a local snapshot every
/// tick and logs whatever remote state gets through the warm-up gate.
fn spawn_control(
    mut control: ControlPort,
    level: u8,
    shape: LevelShape,
    tick: Duration,
) -> Result<thread::JoinHandle<()>> {
    let mut local = Snapshot::blank(shape, 0, 0)?;

    let handle = thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let mut frame: u32 = 0;
            loop {
                local.x = (frame % 160) as u8;
                if let Err(error) = control.push_outbound(local.into(), shape) {
                    debug!("Control loop stopping: {}", error);
                    break;
                }

                match control.poll_admitted() {
                    Some(SyncMessage::Snapshot(remote)) => debug!(
                        "Remote at ({}, {}) with {} coins, {} enemies down",
                        remote.x,
                        remote.y,
                        remote.coin_count,
                        remote.enemy_dead.count()
                    ),
                    Some(SyncMessage::EndOfLevel(end)) => {
                        info!("Remote finished level {} ({})", end.level, end.winner as char);
                        let announced = control.announce_end_of_level(
                            EndOfLevel {
                                level,
                                winner: WINNER_PLAYER,
                            },
                            shape,
                        );
                        if let Err(error) = announced {
                            debug!("Control loop stopping: {}", error);
                            break;
                        }
                        control.reset_gate();
                    }
                    None => {}
                }

                frame = frame.wrapping_add(1);
                thread::sleep(tick);
            }
        })?;

    Ok(handle)
}
