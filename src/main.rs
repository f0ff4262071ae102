use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use voicelink::{
    VoiceManager,
    common::{logger, types::AnyResult},
    configs::Config,
    gateway::{InboundFrame, StaticCredentials, VoiceEvent, constants::SILENCE_FRAME},
};

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);

    info!(
        "voicelink {} ({}@{})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_BRANCH").unwrap_or("unknown"),
        option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
    );

    let Some(session) = config.session.clone() else {
        return Err("no [session] table in config; nothing to connect".into());
    };

    let manager = VoiceManager::new(
        Arc::new(StaticCredentials::new(session.credentials())),
        config.gateway.clone(),
    );

    let on_frame = Arc::new(|frame: InboundFrame| {
        debug!(
            "Inbound frame ssrc={} user={:?} seq={} ({} bytes)",
            frame.ssrc,
            frame.user_id,
            frame.sequence,
            frame.payload.len()
        );
    });

    let connection = manager
        .connect(session.guild_id, session.channel_id, on_frame)
        .await?;
    info!("[{}] Connected, sending silence", session.guild_id);

    let mut events = connection.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(VoiceEvent::Disconnected { reason }) => {
                    warn!("Session ended: {:?}", reason);
                    break;
                }
                Ok(VoiceEvent::Diagnostic { message }) => warn!("Diagnostic: {}", message),
                Ok(event) => debug!("Event: {:?}", event),
                Err(RecvError::Lagged(n)) => warn!("Event subscriber lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sink = connection.transmit_sink();
    let feeder = tokio::spawn(async move {
        while sink.enqueue(&SILENCE_FRAME[..]).await.is_ok() {}
    });

    let mut stats_tick = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
            _ = stats_tick.tick() => {
                info!(
                    "[{}] state={:?} ping={:?} udp_ping={:?} stats={:?}",
                    session.guild_id,
                    connection.state(),
                    connection.ping(),
                    connection.udp_ping(),
                    connection.stats()
                );
            }
        }
    }

    info!("Shutting down");
    manager.shutdown().await;
    drop(connection);
    let _ = feeder.await;
    let _ = event_task.await;
    Ok(())
}
