mod app;
mod connection;
mod theme;
mod widgets;

use onda_proto::protocol::DaemonState;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = onda_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("tui.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let log_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,onda_tui=debug".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    // Print the log path to stderr so the operator can tail it immediately.
    eprintln!("onda log: {}", log_path.display());

    tracing::info!("onda starting…");

    let config = onda_proto::config::Config::load().unwrap_or_default();

    // Seed the UI with the configured station so the header is meaningful
    // before the first daemon snapshot arrives.
    let initial_state = DaemonState {
        station_name: config.station.name.clone(),
        station_url: config.station.url.clone(),
        volume: config.media.default_volume,
        ..Default::default()
    };

    let (msg_tx, msg_rx) = mpsc::channel::<app::AppMessage>(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    tokio::spawn(connection::run(
        onda_proto::platform::daemon_address(),
        msg_tx.clone(),
        cmd_rx,
    ));

    let app = app::App::new(initial_state, cmd_tx);
    app.run(msg_tx, msg_rx).await?;

    Ok(())
}
