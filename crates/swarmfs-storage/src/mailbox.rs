//! Directory-based mailbox queues.
//!
//! Layout: `{root}/{agent_id}/{pending,processing,archive,error}/{message_id}.json`.
//! A message's directory is its state. Every transition is a single
//! `rename`, so a message is always in exactly one directory, and the rename
//! out of `pending/` doubles as the claim: when two consumers race, the
//! loser's rename fails with `NotFound` and it moves on.
//!
//! Senders need no lock. Each message file has one writer, and it is written
//! under a dot-prefixed `.tmp` name and renamed into place, so consumers
//! (which only look at `*.json`) never see a half-written message.

use std::fmt::Display;
use std::fs::{self, File};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use swarmfs_core::{
    Config, MailboxMessage, MessageDraft, Result, StopSignal, validate_identifier,
};
use tracing::{debug, info, warn};

use crate::document::{atomic_write_bytes, parse_document};

/// Suffix of message files. Anything else in a queue directory is ignored.
pub const MESSAGE_SUFFIX: &str = ".json";

/// Which directory a message currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending,
    Processing,
    Archive,
    Error,
}

impl MessageState {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Processing, Self::Archive, Self::Error];

    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Archive => "archive",
            Self::Error => "error",
        }
    }
}

/// The four directories of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDirs {
    pub pending: PathBuf,
    pub processing: PathBuf,
    pub archive: PathBuf,
    pub error: PathBuf,
}

impl QueueDirs {
    /// Standard layout under `root`.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            pending: root.join(MessageState::Pending.dir_name()),
            processing: root.join(MessageState::Processing.dir_name()),
            archive: root.join(MessageState::Archive.dir_name()),
            error: root.join(MessageState::Error.dir_name()),
        }
    }

    #[must_use]
    pub fn dir(&self, state: MessageState) -> &Path {
        match state {
            MessageState::Pending => &self.pending,
            MessageState::Processing => &self.processing,
            MessageState::Archive => &self.archive,
            MessageState::Error => &self.error,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for state in MessageState::ALL {
            fs::create_dir_all(self.dir(state))?;
        }
        Ok(())
    }
}

/// Counters for one or more polling passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Messages this consumer moved into `processing/`.
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Messages another consumer claimed first.
    pub lost_races: usize,
    /// Messages left in `processing/` because the final move failed.
    pub stranded: usize,
}

impl PollStats {
    pub const fn merge(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.lost_races += other.lost_races;
        self.stranded += other.stranded;
    }
}

fn is_message_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(MESSAGE_SUFFIX) && !n.starts_with('.'))
}

/// Message files in `dir`, oldest name first. A missing directory is empty.
pub fn list_messages(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() && is_message_file(&entry.path()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Move `path` into `dest_dir`, keeping its file name.
///
/// Returns `Ok(None)` if the source is already gone (another consumer moved
/// it first).
pub fn move_into(path: &Path, dest_dir: &Path) -> Result<Option<PathBuf>> {
    let Some(name) = path.file_name() else {
        return Ok(None);
    };
    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(name);
    match fs::rename(path, &dest) {
        Ok(()) => Ok(Some(dest)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Claim a pending file by renaming it into `processing_dir`.
///
/// The claimed file's mtime is reset so orphan recovery measures time spent
/// in `processing/`, not time since the message was sent.
pub fn claim(path: &Path, processing_dir: &Path) -> Result<Option<PathBuf>> {
    let claimed = move_into(path, processing_dir)?;
    if let Some(dest) = &claimed
        && let Err(e) = refresh_claim(dest)
    {
        debug!(path = %dest.display(), error = %e, "could not refresh claim mtime");
    }
    Ok(claimed)
}

/// Reset a claimed file's mtime to now.
///
/// [`Mailbox::recover_processing`] judges orphans by mtime alone, so a
/// handler that may run longer than the recovery age should call this
/// periodically on the path it was given.
pub fn refresh_claim(path: &Path) -> Result<()> {
    File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())?;
    Ok(())
}

/// One pass over `dirs.pending`: claim each message file, run `handler`, and
/// route it to `archive/` on `Ok` or `error/` on `Err` or panic.
///
/// Stops early (between files) once `stop` is raised.
pub fn process_pending<F, E>(dirs: &QueueDirs, handler: &mut F, stop: &StopSignal) -> Result<PollStats>
where
    F: FnMut(&Path) -> std::result::Result<(), E>,
    E: Display,
{
    let mut stats = PollStats::default();
    for path in list_messages(&dirs.pending)? {
        if stop.is_stopped() {
            break;
        }
        let Some(claimed) = claim(&path, &dirs.processing)? else {
            stats.lost_races += 1;
            continue;
        };
        stats.claimed += 1;

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&claimed)));
        let dest_dir = match outcome {
            Ok(Ok(())) => {
                stats.succeeded += 1;
                &dirs.archive
            }
            Ok(Err(e)) => {
                stats.failed += 1;
                warn!(path = %claimed.display(), error = %e, "message handler failed");
                &dirs.error
            }
            Err(_) => {
                stats.failed += 1;
                warn!(path = %claimed.display(), "message handler panicked");
                &dirs.error
            }
        };
        match move_into(&claimed, dest_dir) {
            Ok(Some(_)) => {}
            Ok(None) => {
                stats.stranded += 1;
                warn!(path = %claimed.display(), "claimed message vanished before routing");
            }
            Err(e) => {
                stats.stranded += 1;
                warn!(path = %claimed.display(), error = %e, "failed to route processed message");
            }
        }
    }
    Ok(stats)
}

/// Poll `dirs.pending` every `poll_interval` until `stop` is raised.
///
/// Handler failures never end the loop; neither do listing errors, which are
/// logged and retried on the next tick. The wait between polls wakes as soon
/// as `stop` is raised.
pub fn poll_and_process<F, E>(
    dirs: &QueueDirs,
    mut handler: F,
    poll_interval: Duration,
    stop: &StopSignal,
) -> Result<PollStats>
where
    F: FnMut(&Path) -> std::result::Result<(), E>,
    E: Display,
{
    dirs.ensure()?;
    let mut total = PollStats::default();
    loop {
        if stop.is_stopped() {
            break;
        }
        match process_pending(dirs, &mut handler, stop) {
            Ok(stats) => total.merge(stats),
            Err(e) => warn!(dir = %dirs.pending.display(), error = %e, "mailbox poll failed"),
        }
        if stop.wait_timeout(poll_interval) {
            break;
        }
    }
    debug!(dir = %dirs.pending.display(), ?total, "mailbox poller stopped");
    Ok(total)
}

/// Per-agent mailboxes rooted at one directory.
#[derive(Debug, Clone)]
pub struct Mailbox {
    root: PathBuf,
}

impl Mailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mailbox_root.clone())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Queue directories for `agent_id`.
    pub fn dirs(&self, agent_id: &str) -> Result<QueueDirs> {
        validate_identifier("agent_id", agent_id)?;
        Ok(QueueDirs::under(&self.root.join(agent_id)))
    }

    /// Address `draft` to `recipient` and drop it into their `pending/`.
    pub fn send(&self, recipient: &str, draft: &MessageDraft) -> Result<MailboxMessage> {
        let message = draft.address(recipient)?;
        self.deliver(&message)?;
        Ok(message)
    }

    /// Write an already addressed message into its recipient's `pending/`.
    pub fn deliver(&self, message: &MailboxMessage) -> Result<PathBuf> {
        message.validate()?;
        let dirs = self.dirs(&message.recipient_id)?;
        let path = dirs
            .pending
            .join(format!("{}{MESSAGE_SUFFIX}", message.message_id));
        let content = serde_json::to_vec_pretty(message)?;
        atomic_write_bytes(&path, &content)?;
        debug!(
            message_id = %message.message_id,
            sender = %message.sender_id,
            recipient = %message.recipient_id,
            kind = %message.kind,
            "message delivered"
        );
        Ok(path)
    }

    /// Send one copy of `draft` to every recipient except the sender.
    ///
    /// Delivery is per recipient: a failure for one inbox is logged and does
    /// not prevent the others. An invalid draft is rejected up front.
    pub fn broadcast<'a, I>(&self, recipients: I, draft: &MessageDraft) -> Result<Vec<MailboxMessage>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        draft.address(&draft.sender_id)?;
        let mut delivered = Vec::new();
        for recipient in recipients {
            if recipient == draft.sender_id {
                continue;
            }
            match self.send(recipient, draft) {
                Ok(message) => delivered.push(message),
                Err(e) => warn!(recipient, error = %e, "broadcast delivery failed"),
            }
        }
        Ok(delivered)
    }

    /// Message files for `agent_id` in `state`, oldest first.
    pub fn list(&self, agent_id: &str, state: MessageState) -> Result<Vec<PathBuf>> {
        list_messages(self.dirs(agent_id)?.dir(state))
    }

    /// Parse a message file.
    pub fn read_message(path: &Path) -> Result<MailboxMessage> {
        let raw = fs::read(path)?;
        parse_document(path, &raw)
    }

    /// Current state of `message_id` in `agent_id`'s mailbox.
    pub fn locate(&self, agent_id: &str, message_id: &str) -> Result<Option<MessageState>> {
        validate_identifier("message_id", message_id)?;
        let dirs = self.dirs(agent_id)?;
        let name = format!("{message_id}{MESSAGE_SUFFIX}");
        Ok(MessageState::ALL
            .into_iter()
            .find(|state| dirs.dir(*state).join(&name).is_file()))
    }

    /// Process `agent_id`'s inbox until `stop` is raised.
    ///
    /// Files that do not parse as messages go to `error/` without reaching
    /// `handler`.
    pub fn process_inbox<F, E>(
        &self,
        agent_id: &str,
        mut handler: F,
        poll_interval: Duration,
        stop: &StopSignal,
    ) -> Result<PollStats>
    where
        F: FnMut(&MailboxMessage) -> std::result::Result<(), E>,
        E: Display,
    {
        let dirs = self.dirs(agent_id)?;
        info!(agent_id, root = %self.root.display(), "mailbox consumer started");
        poll_and_process(
            &dirs,
            |path: &Path| -> std::result::Result<(), String> {
                let message = Self::read_message(path).map_err(|e| e.to_string())?;
                handler(&message).map_err(|e| e.to_string())
            },
            poll_interval,
            stop,
        )
    }

    /// Return messages stuck in `processing/` longer than `older_than` (a
    /// consumer died mid-handler) to `pending/`. Returns how many moved.
    ///
    /// Age is the claimed file's mtime. A live consumer still inside a
    /// handler that outlasts `older_than` looks orphaned too: its message is
    /// handed out again and its own routing move reports `stranded`. Pick
    /// `older_than` above the longest handler run, or have long handlers
    /// call [`refresh_claim`].
    pub fn recover_processing(&self, agent_id: &str, older_than: Duration) -> Result<usize> {
        let dirs = self.dirs(agent_id)?;
        let now = SystemTime::now();
        let mut recovered = 0;
        for path in list_messages(&dirs.processing)? {
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| now.duration_since(m).ok());
            if !age.is_some_and(|a| a >= older_than) {
                continue;
            }
            if move_into(&path, &dirs.pending)?.is_some() {
                recovered += 1;
                info!(agent_id, path = %path.display(), "recovered orphaned message");
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarmfs_core::Priority;
    use tempfile::TempDir;

    fn draft() -> MessageDraft {
        MessageDraft::new("agent-a", "task_update", json!({"task_id": "t1"}))
            .with_priority(Priority::High)
    }

    #[test]
    fn test_send_lands_in_pending() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let msg = mailbox.send("agent-b", &draft()).unwrap();

        let pending = mailbox.list("agent-b", MessageState::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        let read = Mailbox::read_message(&pending[0]).unwrap();
        assert_eq!(read, msg);
        assert_eq!(read.priority, Priority::High);
        assert_eq!(
            mailbox.locate("agent-b", &msg.message_id).unwrap(),
            Some(MessageState::Pending)
        );
    }

    #[test]
    fn test_send_rejects_bad_recipient() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        assert!(mailbox.send("../escape", &draft()).is_err());
        assert!(mailbox.send("", &draft()).is_err());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let sent = mailbox
            .broadcast(["agent-a", "agent-b", "agent-c"], &draft())
            .unwrap();
        assert_eq!(sent.len(), 2);
        assert!(mailbox.list("agent-a", MessageState::Pending).unwrap().is_empty());
        assert_eq!(mailbox.list("agent-c", MessageState::Pending).unwrap().len(), 1);
        assert_ne!(sent[0].message_id, sent[1].message_id);
    }

    #[test]
    fn test_process_routes_success_and_failure() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let ok = mailbox
            .send("agent-b", &MessageDraft::new("agent-a", "ok", json!(1)))
            .unwrap();
        let bad = mailbox
            .send("agent-b", &MessageDraft::new("agent-a", "bad", json!(2)))
            .unwrap();

        let dirs = mailbox.dirs("agent-b").unwrap();
        let stop = StopSignal::new();
        let mut handler = |path: &Path| -> std::result::Result<(), String> {
            let msg = Mailbox::read_message(path).map_err(|e| e.to_string())?;
            if msg.kind == "bad" {
                Err("boom".into())
            } else {
                Ok(())
            }
        };
        let stats = process_pending(&dirs, &mut handler, &stop).unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            mailbox.locate("agent-b", &ok.message_id).unwrap(),
            Some(MessageState::Archive)
        );
        assert_eq!(
            mailbox.locate("agent-b", &bad.message_id).unwrap(),
            Some(MessageState::Error)
        );
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let msg = mailbox.send("agent-b", &draft()).unwrap();
        let dirs = mailbox.dirs("agent-b").unwrap();
        let mut handler = |_: &Path| -> std::result::Result<(), String> { panic!("handler bug") };
        let stats = process_pending(&dirs, &mut handler, &StopSignal::new()).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(
            mailbox.locate("agent-b", &msg.message_id).unwrap(),
            Some(MessageState::Error)
        );
    }

    #[test]
    fn test_foreign_files_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let dirs = mailbox.dirs("agent-b").unwrap();
        dirs.ensure().unwrap();
        fs::write(dirs.pending.join("notes.txt"), "hi").unwrap();
        fs::write(dirs.pending.join(".half.json.1.2.tmp"), "{").unwrap();

        let mut calls = 0;
        let mut handler = |_: &Path| -> std::result::Result<(), String> {
            calls += 1;
            Ok(())
        };
        let stats = process_pending(&dirs, &mut handler, &StopSignal::new()).unwrap();
        assert_eq!(stats, PollStats::default());
        assert_eq!(calls, 0);
        assert!(dirs.pending.join("notes.txt").exists());
        assert!(dirs.pending.join(".half.json.1.2.tmp").exists());
    }

    #[test]
    fn test_claim_loser_sees_none() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        mailbox.send("agent-b", &draft()).unwrap();
        let dirs = mailbox.dirs("agent-b").unwrap();
        let path = list_messages(&dirs.pending).unwrap().remove(0);
        assert!(claim(&path, &dirs.processing).unwrap().is_some());
        assert!(claim(&path, &dirs.processing).unwrap().is_none());
    }

    #[test]
    fn test_process_inbox_stops_and_routes_unparseable() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        mailbox.send("agent-b", &draft()).unwrap();
        let dirs = mailbox.dirs("agent-b").unwrap();
        fs::write(dirs.pending.join("garbage.json"), "{{{").unwrap();

        let stop = StopSignal::new();
        let stopper = stop.clone();
        let mut seen = Vec::new();
        let stats = mailbox
            .process_inbox(
                "agent-b",
                |msg: &MailboxMessage| -> std::result::Result<(), String> {
                    seen.push(msg.kind.clone());
                    stopper.stop();
                    Ok(())
                },
                Duration::from_secs(60),
                &stop,
            )
            .unwrap();
        assert_eq!(seen, vec!["task_update".to_string()]);
        assert_eq!(stats.succeeded + stats.failed, stats.claimed);
        assert!(stats.succeeded == 1);
    }

    #[test]
    fn test_poll_loop_exits_promptly_mid_sleep() {
        let tmp = TempDir::new().unwrap();
        let dirs = QueueDirs::under(tmp.path());
        let stop = StopSignal::new();
        let stopper = stop.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let stats = poll_and_process(
                &dirs,
                |_: &Path| -> std::result::Result<(), String> { Ok(()) },
                Duration::from_secs(3600),
                &stop,
            )
            .unwrap();
            (stats, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
        let (stats, elapsed) = handle.join().unwrap();
        assert_eq!(stats, PollStats::default());
        assert!(elapsed < Duration::from_secs(10));
        assert!(tmp.path().join("archive").is_dir());
    }

    #[test]
    fn test_recover_processing_returns_orphans() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let msg = mailbox.send("agent-b", &draft()).unwrap();
        let dirs = mailbox.dirs("agent-b").unwrap();
        let path = list_messages(&dirs.pending).unwrap().remove(0);
        claim(&path, &dirs.processing).unwrap();

        assert_eq!(
            mailbox
                .recover_processing("agent-b", Duration::from_secs(3600))
                .unwrap(),
            0
        );
        assert_eq!(mailbox.recover_processing("agent-b", Duration::ZERO).unwrap(), 1);
        assert_eq!(
            mailbox.locate("agent-b", &msg.message_id).unwrap(),
            Some(MessageState::Pending)
        );
    }

    #[test]
    fn test_refreshed_claim_is_not_recovered() {
        let tmp = TempDir::new().unwrap();
        let mailbox = Mailbox::new(tmp.path());
        let msg = mailbox.send("agent-b", &draft()).unwrap();
        let dirs = mailbox.dirs("agent-b").unwrap();
        let path = list_messages(&dirs.pending).unwrap().remove(0);
        let claimed = claim(&path, &dirs.processing).unwrap().unwrap();

        // A handler that has been running for two hours.
        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        File::options()
            .write(true)
            .open(&claimed)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();
        refresh_claim(&claimed).unwrap();

        assert_eq!(
            mailbox
                .recover_processing("agent-b", Duration::from_secs(3600))
                .unwrap(),
            0
        );
        assert_eq!(
            mailbox.locate("agent-b", &msg.message_id).unwrap(),
            Some(MessageState::Processing)
        );
        assert!(refresh_claim(&dirs.pending.join("gone.json")).is_err());
    }
}
