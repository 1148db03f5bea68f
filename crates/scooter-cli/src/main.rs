//! Scooter Scan - BLE scanner and session client
//!
//! This binary scans for Ninebot/Xiaomi scooters, lists what it found and
//! can open a session to one of them:
//! - Discovery via the btleplug transport
//! - Connection and handshake through the session controller
//! - Parsed frames printed until Ctrl-C

use anyhow::bail;
use clap::Parser;
use tracing::{error, info, warn};

use scooter_cli::{init_logging, load_config, scan_line, scan_report, select_target, Args};
use scooter_session::{event_channel, BleTransport, ConnectionState, PlaintextOnly, SessionController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = load_config(args.config.as_ref())?;
    info!(
        timeout = ?config.discovery.advertisement_timeout,
        prefixes = ?config.discovery.name_prefixes,
        "Starting scooter scan"
    );

    let (events_tx, events_rx) = event_channel();
    let mut transport = BleTransport::new(events_tx, config.discovery.clone()).await?;
    transport.start_scan().await?;

    // Encrypted handshakes need an engine supplied by the embedding application
    let (controller, handle) = SessionController::new(transport, &config, PlaintextOnly);
    let controller_task = tokio::spawn(async move {
        if let Err(e) = controller.run(events_rx).await {
            error!("Session controller error: {}", e);
        }
    });

    tokio::time::sleep(args.scan_duration()).await;
    let scooters = handle.discovered();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&scan_report(&scooters))?);
    } else if scooters.is_empty() {
        println!("No scooters found");
    } else {
        for scooter in &scooters {
            println!("{}", scan_line(scooter));
        }
    }

    let Some(query) = args.connect.as_deref() else {
        handle.shutdown().await?;
        controller_task.await?;
        return Ok(());
    };

    let Some(target) = select_target(&scooters, query) else {
        handle.shutdown().await?;
        controller_task.await?;
        bail!("no scooter named {query} was found");
    };

    let mut state = handle.subscribe_state();
    let mut frames = handle.subscribe_frames();
    handle.connect_to(target, args.force_nb_crypto).await?;

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                info!(
                    state = %snapshot.connection_state,
                    model = ?snapshot.model,
                    variant = ?snapshot.variant,
                    "Session state"
                );
                if snapshot.connection_state == ConnectionState::Disconnected {
                    warn!("Session ended");
                    break;
                }
            }

            frame = frames.recv() => {
                match frame {
                    Ok(frame) => println!(
                        "cmd={:02X} arg={:02X} payload={:02X?}",
                        frame.command, frame.argument, &frame.payload[..]
                    ),
                    Err(e) => warn!("Frame stream: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.disconnect_from_scooter().await?;
    handle.shutdown().await?;
    controller_task.await?;
    Ok(())
}
