//! The per-`EmailConfig` worker task: full sync, incremental fetch, IDLE,
//! and deletion reconciliation, modeled on the teacher's single-task
//! `tokio::select!` background processor.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sbm_common::shutdown::ShutdownChannel;
use sbm_common::task::CoreTask;
use sbm_common::time::TimestampMillis;

use crate::imap::{FetchedMessage, ImapSession};
use crate::model::{EmailConfig, EmailLog, EmailLogStatus};
use crate::store::Store;

const UID_FETCH_CHUNK_SIZE: usize = 50;

/// Drives one mailbox's IMAP session through its phases until told to stop.
/// `Stop` (via `shutdown`) must interrupt any in-flight FETCH/IDLE without
/// the caller holding the connections registry lock.
pub fn spawn<S: ImapSession + 'static>(
    config: EmailConfig,
    mailbox: String,
    mut session: S,
    store: Arc<dyn Store>,
    mut shutdown: ShutdownChannel,
) -> CoreTask<()> {
    CoreTask::spawn(async move {
        if let Err(e) = session.select(&mailbox).await {
            error!(config_id = %config.id, error = %e, "IMAP SELECT failed");
            return;
        }

        let mut first_run = config.last_check.is_none();

        loop {
            let cycle = async {
                if first_run {
                    full_sync(&mut session, &store, &config, &mailbox).await
                } else {
                    incremental_fetch(&mut session, &store, &config, &mailbox).await
                }
            };

            tokio::select! {
                biased;
                () = shutdown.recv() => {
                    info!(config_id = %config.id, "IMAP manager stopping");
                    session.terminate();
                    return;
                }
                result = cycle => {
                    if let Err(e) = result {
                        warn!(config_id = %config.id, error = %e, "IMAP sync cycle failed");
                    }
                    first_run = false;
                }
            }

            tokio::select! {
                biased;
                () = shutdown.recv() => {
                    info!(config_id = %config.id, "IMAP manager stopping");
                    session.terminate();
                    return;
                }
                result = session.idle() => {
                    if let Err(e) = result {
                        warn!(config_id = %config.id, error = %e, "IDLE failed, exiting loop");
                        return;
                    }
                    debug!(config_id = %config.id, "mailbox update observed, re-syncing");
                }
            }
        }
    })
}

/// Run one on-demand sync cycle outside the background worker loop, for a
/// user-triggered "check now".
pub async fn manual_check<S: ImapSession>(
    session: &mut S,
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
) -> anyhow::Result<()> {
    session.select(mailbox).await?;
    if config.last_check.is_none() {
        full_sync(session, store, config, mailbox).await
    } else {
        incremental_fetch(session, store, config, mailbox).await
    }
}

async fn full_sync<S: ImapSession>(
    session: &mut S,
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
) -> anyhow::Result<()> {
    let uids = session.uid_search_all().await?;
    fetch_and_process_chunks(session, store, config, mailbox, &uids).await?;
    reconcile_deletions(store, config, mailbox, &uids).await?;
    Ok(())
}

async fn incremental_fetch<S: ImapSession>(
    session: &mut S,
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
) -> anyhow::Result<()> {
    let uids = session.uid_search_unseen().await?;
    fetch_and_process_chunks(session, store, config, mailbox, &uids).await?;
    for uid in &uids {
        session.uid_store_seen(*uid).await?;
    }
    Ok(())
}

async fn fetch_and_process_chunks<S: ImapSession>(
    session: &mut S,
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
    uids: &[u32],
) -> anyhow::Result<()> {
    for chunk in uids.chunks(UID_FETCH_CHUNK_SIZE) {
        let messages = session.uid_fetch_metadata(chunk).await?;
        for message in messages {
            process_message(store, config, mailbox, message, false).await?;
        }
    }
    Ok(())
}

/// Insert-or-update a log row for one fetched message, per the metadata
/// update rule: deleted-but-reappeared rows are restored, attachment counts
/// only increase unless `force_refresh`, and URL fields are filled only when
/// currently empty.
pub async fn process_message(
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
    message: FetchedMessage,
    force_refresh: bool,
) -> anyhow::Result<()> {
    let existing = store
        .find_email_log(config.owner, config.id, mailbox, message.uid)
        .await?;

    let log = match existing {
        Some(mut log) => {
            if log.status == EmailLogStatus::Deleted {
                log.status = if log.parsed_invoice_id.is_some() {
                    EmailLogStatus::Parsed
                } else {
                    EmailLogStatus::Received
                };
            }
            if force_refresh {
                log.has_attachment = message.has_attachment;
                log.attachment_count = message.attachment_count;
            } else if message.attachment_count > log.attachment_count {
                log.has_attachment = message.has_attachment || log.has_attachment;
                log.attachment_count = message.attachment_count;
            }
            log
        }
        None => EmailLog {
            id: Uuid::new_v4(),
            owner: config.owner,
            email_config_id: config.id,
            mailbox: mailbox.to_string(),
            message_uid: message.uid,
            subject: message.subject.clone(),
            from: message.from.clone(),
            received_at: message.received_at.and_then(TimestampMillis::from_millis_checked),
            has_attachment: message.has_attachment,
            attachment_count: message.attachment_count,
            invoice_xml_url: None,
            invoice_pdf_url: None,
            status: EmailLogStatus::Received,
            parse_error: None,
            parsed_invoice_id: None,
            parsed_invoice_ids: Vec::new(),
        },
    };
    store.put_email_log(log).await?;
    Ok(())
}

/// After a full-sync UID listing, mark every log row for `(owner, config,
/// mailbox)` whose `message_uid` is absent from the server set as `deleted`.
async fn reconcile_deletions(
    store: &Arc<dyn Store>,
    config: &EmailConfig,
    mailbox: &str,
    server_uids: &[u32],
) -> anyhow::Result<()> {
    let server_set: std::collections::HashSet<u32> = server_uids.iter().copied().collect();
    let logs = store.list_email_logs_in_mailbox(config.owner, config.id, mailbox).await?;
    let to_delete: Vec<Uuid> = logs
        .iter()
        .filter(|l| !server_set.contains(&l.message_uid) && l.status != EmailLogStatus::Deleted)
        .map(|l| l.id)
        .collect();
    if !to_delete.is_empty() {
        store.mark_logs_deleted(&to_delete).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn config() -> EmailConfig {
        EmailConfig {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            email: "owner@example.com".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            password: "secret".to_string(),
            is_active: true,
            last_check: None,
        }
    }

    fn message(uid: u32, attachment_count: u32) -> FetchedMessage {
        FetchedMessage {
            uid,
            subject: Some("invoice".to_string()),
            from: Some("billing@example.com".to_string()),
            received_at: Some(TimestampMillis::now().as_i64()),
            has_attachment: attachment_count > 0,
            attachment_count,
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn process_message_inserts_new_log() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 2), false).await.unwrap();

        let log = store.find_email_log(config.owner, config.id, "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(log.status, EmailLogStatus::Received);
        assert_eq!(log.attachment_count, 2);
        assert!(log.has_attachment);
    }

    #[tokio::test]
    async fn process_message_only_increases_attachment_count_without_force_refresh() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 2), false).await.unwrap();
        process_message(&store, &config, "INBOX", message(1, 1), false).await.unwrap();

        let log = store.find_email_log(config.owner, config.id, "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(log.attachment_count, 2, "a lower count must not overwrite a higher one");
    }

    #[tokio::test]
    async fn process_message_force_refresh_overwrites_attachment_count() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 2), false).await.unwrap();
        process_message(&store, &config, "INBOX", message(1, 1), true).await.unwrap();

        let log = store.find_email_log(config.owner, config.id, "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(log.attachment_count, 1);
    }

    #[tokio::test]
    async fn process_message_restores_a_deleted_log_that_reappeared() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 0), false).await.unwrap();
        store.mark_logs_deleted(&[store.find_email_log(config.owner, config.id, "INBOX", 1).await.unwrap().unwrap().id]).await.unwrap();

        process_message(&store, &config, "INBOX", message(1, 0), false).await.unwrap();
        let log = store.find_email_log(config.owner, config.id, "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(log.status, EmailLogStatus::Received);
    }

    #[tokio::test]
    async fn reconcile_deletions_marks_missing_uids_deleted() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 0), false).await.unwrap();
        process_message(&store, &config, "INBOX", message(2, 0), false).await.unwrap();

        reconcile_deletions(&store, &config, "INBOX", &[1]).await.unwrap();

        let logs = store.list_email_logs_in_mailbox(config.owner, config.id, "INBOX").await.unwrap();
        let log1 = logs.iter().find(|l| l.message_uid == 1).unwrap();
        let log2 = logs.iter().find(|l| l.message_uid == 2).unwrap();
        assert_eq!(log1.status, EmailLogStatus::Received);
        assert_eq!(log2.status, EmailLogStatus::Deleted);
    }

    #[tokio::test]
    async fn reconcile_deletions_leaves_already_deleted_logs_alone() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = config();
        process_message(&store, &config, "INBOX", message(1, 0), false).await.unwrap();
        reconcile_deletions(&store, &config, "INBOX", &[]).await.unwrap();
        // Second reconcile with the same empty server set is a no-op, not an error.
        reconcile_deletions(&store, &config, "INBOX", &[]).await.unwrap();

        let logs = store.list_email_logs_in_mailbox(config.owner, config.id, "INBOX").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, EmailLogStatus::Deleted);
    }
}
