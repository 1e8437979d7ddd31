use std::{io::Write, time::SystemTime};

use foxglove_ws_protocol::events::NullHandler;
use foxglove_ws_protocol::protocol::json::NewChannel;
use foxglove_ws_protocol::server::{FoxgloveServer, ServerOptions};

fn build_string_message(data: &str) -> anyhow::Result<Vec<u8>> {
    let mut msg = vec![0; std::mem::size_of::<u32>() + data.len()];
    // ROS 1 message strings are encoded as 4-bytes length and then the byte data.
    let mut w = std::io::Cursor::new(&mut msg);
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(data.as_bytes())?;
    Ok(msg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let server = FoxgloveServer::new(ServerOptions::new("example-server"), NullHandler);

    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 8765)).await }
    });

    let channel = server
        .add_channel(NewChannel {
            topic: "/data".to_string(),
            encoding: "ros1".to_string(),
            schema_name: "std_msgs/String".to_string(),
            schema: "string data".to_string(),
            schema_encoding: Some("ros1msg".to_string()),
        })
        .await;

    let mut counter = 0;
    loop {
        server
            .broadcast_message(
                channel.id,
                SystemTime::now().elapsed().unwrap().as_nanos() as u64,
                &build_string_message(&format!("Hello {counter}!"))?,
            )
            .await?;
        counter += 1;
        tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
    }
}
