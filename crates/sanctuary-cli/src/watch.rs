//! Follow one room in the terminal.

use std::collections::HashSet;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use sanctuary_client::{RoomSession, SessionState};
use sanctuary_shared::{Message, MessageId};

const RESYNC_INTERVAL: Duration = Duration::from_secs(15);

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.display_name(),
        message.body
    );
}

fn print_new(session: &RoomSession, printed: &mut HashSet<MessageId>) {
    for message in session.current_messages() {
        if printed.insert(message.id.clone()) {
            print_message(&message);
        }
    }
}

/// Print the room until Ctrl+C. With `send`, every stdin line is posted.
pub async fn follow(session: RoomSession, send: bool) -> anyhow::Result<()> {
    info!(room = %session.room_id(), state = ?session.state(), "Following room");
    if let Some(e) = session.fetch_error() {
        warn!(error = %e, "History unavailable, showing live messages only");
    }

    let mut printed = HashSet::new();
    let mut changes = session.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reading = send;
    let mut resync = tokio::time::interval(RESYNC_INTERVAL);
    resync.tick().await;

    print_new(&session, &mut printed);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new(&session, &mut printed);
            }
            line = lines.next_line(), if reading => match line? {
                Some(line) => {
                    if let Err(e) = session.send(&line).await {
                        warn!(error = %e, retryable = e.is_retryable(), "Message not sent");
                    }
                }
                None => reading = false,
            },
            _ = resync.tick() => {
                if session.state() == SessionState::Degraded {
                    match session.resync().await {
                        Ok(()) => info!(room = %session.room_id(), "Room back in sync"),
                        Err(e) => warn!(error = %e, "Resync failed, will retry"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving room");
                break;
            }
        }
    }

    session.stop().await;
    Ok(())
}
