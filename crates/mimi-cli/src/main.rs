use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use mimi_client::{
    ClientConfig, Generation, Identity, KeyState, MemoryStore, PipelineView, RoomSession,
};
use mimi_crypto::RoomSecret;
use mimi_types::RoomId;

/// How long to wait for keys and decryption before giving up.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Set to `1` to print the stored (encrypted) records after the transcript.
const ENV_DUMP_RECORDS: &str = "MIMI_DUMP_RECORDS";

/// Local two-participant room: alice and bob share a secret, take turns
/// sending the messages given on the command line, and bob's decrypted view
/// is printed as the transcript.
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mimi=info,mimi_client=info,mimi_crypto=info".into()),
        )
        .init();

    // Config
    let config = ClientConfig::from_env().context("invalid configuration")?;
    let room = config.room.clone().unwrap_or_else(RoomId::random);
    let secret = match config.secret.clone() {
        Some(secret) => secret,
        None => {
            let secret = RoomSecret::generate();
            println!("Room {} secret (share out-of-band): {}", room, secret.expose());
            secret
        }
    };
    let dump_records = std::env::var(ENV_DUMP_RECORDS).is_ok_and(|v| v == "1");

    let mut messages: Vec<String> = std::env::args().skip(1).collect();
    if messages.is_empty() {
        messages = vec![
            "hey bob, is this room private?".into(),
            "only people holding the secret can read it".into(),
        ];
    }

    let store = Arc::new(MemoryStore::new());
    let mut alice = RoomSession::start(
        Arc::clone(&store),
        &config,
        Identity::new("uid-alice", "alice"),
    );
    let mut bob = RoomSession::start(Arc::clone(&store), &config, Identity::new("uid-bob", "bob"));

    info!(room = %room, iterations = config.kdf.iterations(), "Deriving room keys");
    let alice_gen = alice.join(room.clone(), secret.clone()).await?;
    let bob_gen = bob.join(room.clone(), secret).await?;
    wait_for_key(&alice, alice_gen).await?;
    wait_for_key(&bob, bob_gen).await?;

    for (i, text) in messages.iter().enumerate() {
        let sender = if i % 2 == 0 { &alice } else { &bob };
        sender
            .send(text)
            .await
            .map_err(|e| anyhow!("{} could not send: {}", sender.identity().sender_display, e))?;
    }

    let expected = messages.iter().filter(|m| !m.trim().is_empty()).count();
    let view = wait_until(&bob, |v| v.messages.len() == expected && v.is_settled()).await?;

    for message in &view.messages {
        let time = message
            .arrival_marker
            .map(|m| m.0.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "--:--:--".into());
        println!("[{}] {}: {}", time, message.sender_display, message.body);
    }

    if dump_records {
        let records = store.records(&room);
        println!("{}", serde_json::to_string_pretty(&records)?);
    }

    alice.leave().await?;
    bob.leave().await?;
    Ok(())
}

async fn wait_until(
    session: &RoomSession<MemoryStore>,
    mut predicate: impl FnMut(&PipelineView) -> bool,
) -> Result<Arc<PipelineView>> {
    let mut rx = session.subscribe();
    let view = tokio::time::timeout(SETTLE_TIMEOUT, rx.wait_for(|v| predicate(&**v)))
        .await
        .context("timed out waiting for the room to settle")??;
    Ok(Arc::clone(&view))
}

async fn wait_for_key(session: &RoomSession<MemoryStore>, generation: Generation) -> Result<()> {
    let view = wait_until(session, |v| {
        v.generation == generation
            && matches!(v.key_state, KeyState::Ready { .. } | KeyState::Failed(_))
    })
    .await?;

    match &view.key_state {
        KeyState::Ready { fingerprint } => {
            info!(who = %session.identity().sender_display, %fingerprint, "Room key ready");
            Ok(())
        }
        KeyState::Failed(reason) => bail!("key derivation failed: {}", reason),
        other => bail!("unexpected key state: {:?}", other),
    }
}
