//! Per-mailbox IMAP connection management: full sync, incremental fetch,
//! IDLE, and deletion reconciliation, driven by a single worker task per
//! active [`crate::model::EmailConfig`].

pub mod bodystructure;
pub mod manager;
pub mod registry;
pub mod session;

/// A fetched message's envelope-derived metadata plus its raw body, as
/// needed by [`crate::invoice::pipeline`].
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub received_at: Option<i64>,
    pub has_attachment: bool,
    pub attachment_count: u32,
    pub body: Vec<u8>,
}

/// The narrow capability set the connection manager needs from an IMAP
/// session, so that `async-imap` and test doubles share one code path. This
/// mirrors the teacher's pattern of depending on small traits at component
/// seams rather than concrete client types.
#[async_trait::async_trait]
pub trait ImapSession: Send {
    async fn select(&mut self, mailbox: &str) -> anyhow::Result<()>;
    /// Full UID listing; implementations fall back to `UID FETCH 1:*` if the
    /// server rejects `UID SEARCH ALL`.
    async fn uid_search_all(&mut self) -> anyhow::Result<Vec<u32>>;
    async fn uid_search_unseen(&mut self) -> anyhow::Result<Vec<u32>>;
    /// `UID FETCH <uids> (UID ENVELOPE BODYSTRUCTURE)`, chunked by the caller.
    async fn uid_fetch_metadata(&mut self, uids: &[u32]) -> anyhow::Result<Vec<FetchedMessage>>;
    /// `UID FETCH <uid> BODY.PEEK[]` — does not mark the message `\Seen`.
    async fn uid_fetch_body(&mut self, uid: u32) -> anyhow::Result<Vec<u8>>;
    async fn uid_store_seen(&mut self, uid: u32) -> anyhow::Result<()>;
    /// Block until the server reports a mailbox update, or the session is
    /// terminated.
    async fn idle(&mut self) -> anyhow::Result<()>;
    /// Close the underlying TCP connection; safe to call concurrently with
    /// any in-flight `idle`/fetch call, and must unblock it.
    fn terminate(&self);
}
