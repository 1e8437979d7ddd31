use foxglove_ws_protocol::client::ClientEngine;
use foxglove_ws_protocol::events::ClientEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let (client, mut events) = ClientEngine::connect("ws://127.0.0.1:8765").await?;

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Advertise { channels } => {
                for channel in channels {
                    log::info!("advertised: {} ({})", channel.topic, channel.id);
                    client.subscribe(channel.id)?;
                }
            }
            ClientEvent::Message {
                subscription_id,
                timestamp_ns,
                payload,
            } => {
                log::info!(
                    "message on subscription {subscription_id} at {timestamp_ns}: {} bytes",
                    payload.len()
                );
            }
            ClientEvent::Close => break,
            ClientEvent::Error(message) => {
                log::error!("client error: {message}");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
