//! The concrete `async-imap` + TLS-backed [`ImapSession`]. Kept separate from
//! [`crate::imap::manager`] so the manager stays generic and testable against
//! an in-memory double.

use async_imap::types::{BodyStructure, Fetch};
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::net::TcpStream;

use crate::imap::bodystructure::{self, PartInfo};
use crate::imap::{FetchedMessage, ImapSession};

type Stream = TlsStream<TcpStream>;

/// One live IMAP connection, authenticated and ready to `SELECT`.
pub struct AsyncImapSession {
    session: async_imap::Session<Stream>,
    // A duplicated raw handle to the same socket, closed by `terminate` to
    // force any in-flight read (an IDLE wait in particular) to unblock.
    raw: std::net::TcpStream,
}

impl AsyncImapSession {
    /// Connect over TLS and log in. `host` is used both for the TCP
    /// connection and as the TLS server name.
    pub async fn connect(host: &str, port: u16, email: &str, password: &str) -> anyhow::Result<Self> {
        let std_stream = std::net::TcpStream::connect((host, port))?;
        std_stream.set_nodelay(true)?;
        let raw = std_stream.try_clone()?;
        std_stream.set_nonblocking(true)?;
        let tcp = TcpStream::from_std(std_stream)?;

        let tls = async_native_tls::connect(host, tcp).await?;
        let client = async_imap::Client::new(tls);
        let session = client.login(email, password).await.map_err(|(e, _)| anyhow::anyhow!(e))?;
        Ok(Self { session, raw })
    }
}

#[async_trait]
impl ImapSession for AsyncImapSession {
    async fn select(&mut self, mailbox: &str) -> anyhow::Result<()> {
        self.session.select(mailbox).await?;
        Ok(())
    }

    async fn uid_search_all(&mut self) -> anyhow::Result<Vec<u32>> {
        match self.session.uid_search("ALL").await {
            Ok(uids) => Ok(sorted(uids)),
            // Some servers reject UID SEARCH ALL on large mailboxes; UID
            // FETCH 1:* ENVELOPE is equivalent for our purposes.
            Err(_) => {
                let messages: Vec<Fetch> = self.session.uid_fetch("1:*", "UID").await?.try_collect().await?;
                Ok(sorted(messages.iter().filter_map(|m| m.uid).collect()))
            }
        }
    }

    async fn uid_search_unseen(&mut self) -> anyhow::Result<Vec<u32>> {
        let uids = self.session.uid_search("UNSEEN").await?;
        Ok(sorted(uids))
    }

    async fn uid_fetch_metadata(&mut self, uids: &[u32]) -> anyhow::Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sequence = uid_sequence(uids);
        let fetches: Vec<Fetch> = self.session.uid_fetch(sequence, "(UID ENVELOPE BODYSTRUCTURE)").await?.try_collect().await?;
        Ok(fetches.iter().filter_map(fetch_to_message).collect())
    }

    async fn uid_fetch_body(&mut self, uid: u32) -> anyhow::Result<Vec<u8>> {
        let fetches: Vec<Fetch> = self.session.uid_fetch(uid.to_string(), "BODY.PEEK[]").await?.try_collect().await?;
        let body = fetches.first().and_then(|f| f.body()).ok_or_else(|| anyhow::anyhow!("no body returned for uid {uid}"))?;
        Ok(body.to_vec())
    }

    async fn uid_store_seen(&mut self, uid: u32) -> anyhow::Result<()> {
        let _: Vec<Fetch> = self.session.uid_store(uid.to_string(), "+FLAGS (\\Seen)").await?.try_collect().await?;
        Ok(())
    }

    async fn idle(&mut self) -> anyhow::Result<()> {
        let mut handle = self.session.idle();
        handle.init().await?;
        // A concurrent `terminate()` closes the raw socket, which surfaces
        // here as a read error rather than hanging until the server's own
        // IDLE timeout.
        let (_stop, wait) = handle.wait_with_timeout(std::time::Duration::from_secs(29 * 60));
        wait.await?;
        Ok(())
    }

    fn terminate(&self) {
        let _ = self.raw.shutdown(std::net::Shutdown::Both);
    }
}

fn sorted(uids: std::collections::HashSet<u32>) -> Vec<u32> {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable();
    uids
}

/// `UID FETCH` accepts `,`-joined UIDs or ranges; chunking into contiguous
/// runs keeps the command line short for large batches.
fn uid_sequence(uids: &[u32]) -> String {
    uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn fetch_to_message(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope();
    let subject = envelope.and_then(|e| e.subject.as_ref()).map(|s| String::from_utf8_lossy(s).to_string());
    let from = envelope
        .and_then(|e| e.from.as_ref())
        .and_then(|addrs| addrs.first())
        .map(|a| match (&a.mailbox, &a.host) {
            (Some(mbox), Some(host)) => format!("{}@{}", String::from_utf8_lossy(mbox), String::from_utf8_lossy(host)),
            (Some(mbox), None) => String::from_utf8_lossy(mbox).to_string(),
            _ => String::new(),
        });
    let received_at = envelope
        .and_then(|e| e.date.as_ref())
        .and_then(|d| std::str::from_utf8(d).ok())
        .and_then(|d| sbm_common::time::TimestampMillis::parse_rfc2822(d).ok())
        .map(|ts| ts.as_i64());

    let mut parts = Vec::new();
    if let Some(bs) = fetch.bodystructure() {
        flatten_bodystructure(bs, false, &mut parts);
    }
    let attachment_count = bodystructure::count_attachments(&parts);

    Some(FetchedMessage { uid, subject, from, received_at, has_attachment: attachment_count > 0, attachment_count, body: Vec::new() })
}

/// Walks a parsed `BODYSTRUCTURE` tree into the flat [`PartInfo`] list
/// [`bodystructure::count_attachments`] expects. `under_multipart` marks every
/// part nested below the top level as a multipart descendant.
fn flatten_bodystructure(bs: &BodyStructure, under_multipart: bool, out: &mut Vec<PartInfo>) {
    match bs {
        BodyStructure::Multipart { bodies, .. } => {
            for child in bodies {
                flatten_bodystructure(child, true, out);
            }
        }
        BodyStructure::Basic { common, other, .. } | BodyStructure::Text { common, other, .. } => {
            let content_type = format!("{}/{}", common.ty.ty, common.ty.subtype);
            let is_attachment_disposition =
                common.disposition.as_ref().is_some_and(|d| d.ty.eq_ignore_ascii_case("attachment"));
            let filename = common.disposition.as_ref().and_then(|d| {
                d.params.iter().find(|(k, _)| k.eq_ignore_ascii_case("filename")).map(|(_, v)| v.to_string())
            });
            out.push(PartInfo {
                content_type,
                is_attachment_disposition,
                filename,
                content_id: other.id.as_ref().map(|s| s.to_string()),
                description: other.description.as_ref().map(|s| s.to_string()),
                is_multipart_descendant: under_multipart,
            });
        }
        BodyStructure::Message { body, .. } => flatten_bodystructure(body, under_multipart, out),
    }
}
