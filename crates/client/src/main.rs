//! tableside-watch - follow one table session from the terminal
//!
//! Usage: `tableside-watch <session-id> [participant-id]`
//!
//! Configuration comes from `TABLESIDE_*` environment variables; the bearer
//! token, if any, from the local token store.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tableside_client::stores::{ArchiveAction, LifecycleNotice};
use tableside_client::{
    logging, ClientConfig, CredentialSupplier, SessionClient, StaticCredentials, TokenStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("tableside_client=debug,tableside_watch=debug");

    let mut args = std::env::args().skip(1);
    let Some(session_id) = args.next() else {
        bail!("usage: tableside-watch <session-id> [participant-id]");
    };
    let participant_id = args.next();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let credentials: Arc<dyn CredentialSupplier> = match TokenStore::open_default() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!("token store unavailable ({}), connecting anonymously", e);
            Arc::new(StaticCredentials::anonymous())
        }
    };

    let client = SessionClient::new(config, credentials);
    let mut session = client.join(&session_id, participant_id);
    session.load_baselines().await;

    let mut cart = session.cart.subscribe();
    let mut roster = session.roster.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            notice = session.notices.recv() => {
                let Some(notice) = notice else { break };
                let archived = matches!(notice, LifecycleNotice::Archived { .. });
                report(&notice);
                if archived {
                    break;
                }
            }
            changed = cart.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = cart.borrow_and_update().clone();
                tracing::info!(
                    items = state.items_count(),
                    total = %state.total(),
                    synced = state.synced,
                    "cart changed"
                );
                for group in state.items_by_participant() {
                    tracing::info!(
                        participant = %group.participant_name,
                        lines = group.items.len(),
                        subtotal = %group.subtotal(),
                        "  per participant"
                    );
                }
                if let Some(error) = &state.error {
                    tracing::warn!("cart error: {}", error);
                }
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = roster.borrow_and_update().clone();
                tracing::info!(
                    participants = state.participants.len(),
                    orders = state.orders.len(),
                    "roster changed"
                );
            }
        }
    }

    drop(session);
    client.disconnect_all();
    Ok(())
}

fn report(notice: &LifecycleNotice) {
    match notice {
        LifecycleNotice::Locked { by } => tracing::info!(by = ?by, "session locked"),
        LifecycleNotice::Unlocked { by } => tracing::info!(by = ?by, "session unlocked"),
        LifecycleNotice::Completed { deadline, message } => {
            tracing::info!(%deadline, message = ?message, "session completed")
        }
        LifecycleNotice::ArchivalImminent { remaining } => {
            tracing::warn!("session will be archived in {}s", remaining.as_secs())
        }
        LifecycleNotice::Archived { action, message, .. } => match action {
            ArchiveAction::Redirect => tracing::info!(message = ?message, "session archived, leaving"),
            ArchiveAction::ReturnHome => {
                tracing::info!(message = ?message, "session archived, return home when ready")
            }
        },
        LifecycleNotice::TableReleased(released) => {
            tracing::info!(table = %released.table_number, "table released")
        }
    }
}
