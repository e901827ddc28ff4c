//! The profile table: users, followers, sessions, and per-follower
//! pending-notification queues, with snapshot persistence.
//!
//! All mutating operations serialize through one data mutex.  Persistence
//! runs on its own worker: mutations mark the store dirty and wake it, the
//! worker snapshots under the data lock and writes the file under a
//! separate i/o lock so publishing never stalls on disk.
//!
//! The snapshot contains every profile (username, creation time, counter,
//! followers, retained and pending notifications) but never `sessions`:
//! a session only makes sense next to a live transport connection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::{Mutex as IoMutex, Notify};
use tracing::{error, info, warn};

use nf_proto::wire::{from_bytes, to_bytes, WireDecode, WireEncode, WireError, WireReader, WireWriter};
use nf_proto::{Address, ErrorKind, NotifMessage, Username};
use nf_transport::MailboxSender;

/// Concurrent sessions allowed per profile.
pub const MAX_SESSIONS_PER_PROFILE: usize = 2;

/// A profile-rule violation, answered to the peer as `Resp/Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("client has no active session")]
    NoConnection,
    #[error("no profile exists with that username")]
    UnknownUsername,
    #[error("a profile cannot follow itself")]
    CannotFollowSelf,
    #[error("profile already has the maximum number of sessions")]
    TooManySessions,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NoConnection => ErrorKind::NoConnection,
            StoreError::UnknownUsername => ErrorKind::UnknownUsername,
            StoreError::CannotFollowSelf => ErrorKind::CannotFollowSelf,
            StoreError::TooManySessions => ErrorKind::TooManySessions,
        }
    }
}

/// A notification retained on its author's profile until every follower
/// has consumed it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RetainedNotif {
    id: u64,
    message: NotifMessage,
    sent_at: i64,
    pending_count: u64,
}

impl WireEncode for RetainedNotif {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.id);
        self.message.encode(w);
        w.put_i64(self.sent_at);
        w.put_u64(self.pending_count);
    }
}

impl WireDecode for RetainedNotif {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(RetainedNotif {
            id: r.take_u64()?,
            message: NotifMessage::decode(r)?,
            sent_at: r.take_i64()?,
            pending_count: r.take_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Profile {
    username: Username,
    created_at: i64,
    notif_counter: u64,
    followers: BTreeSet<Username>,
    received_notifs: BTreeMap<u64, RetainedNotif>,
    pending_notifs: VecDeque<(Username, u64)>,
    /// Runtime state only; never persisted.
    sessions: BTreeSet<Address>,
}

impl Profile {
    fn new(username: Username, created_at: i64) -> Self {
        Profile {
            username,
            created_at,
            notif_counter: 0,
            followers: BTreeSet::new(),
            received_notifs: BTreeMap::new(),
            pending_notifs: VecDeque::new(),
            sessions: BTreeSet::new(),
        }
    }
}

impl WireEncode for Profile {
    fn encode(&self, w: &mut WireWriter) {
        self.username.encode(w);
        w.put_i64(self.created_at);
        w.put_u64(self.notif_counter);
        self.followers.encode(w);
        self.received_notifs.encode(w);
        self.pending_notifs.encode(w);
    }
}

impl WireDecode for Profile {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Profile {
            username: Username::decode(r)?,
            created_at: r.take_i64()?,
            notif_counter: r.take_u64()?,
            followers: BTreeSet::decode(r)?,
            received_notifs: BTreeMap::decode(r)?,
            pending_notifs: VecDeque::decode(r)?,
            sessions: BTreeSet::new(),
        })
    }
}

/// One consumed pending notification, ready for delivery fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotif {
    pub sender: Username,
    pub message: NotifMessage,
    pub sent_at: i64,
    /// Live session addresses of the follower at consume time.
    pub receivers: BTreeSet<Address>,
}

struct Data {
    profiles: BTreeMap<Username, Profile>,
    sessions: BTreeMap<Address, Username>,
    dirty: bool,
    active: bool,
}

/// Thread-safe façade over the profile and session tables.
pub struct ProfileStore {
    data: Mutex<Data>,
    persist_wake: Notify,
    file_lock: IoMutex<()>,
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(path = %path.display(), "using file to persist server data");
        ProfileStore {
            data: Mutex::new(Data {
                profiles: BTreeMap::new(),
                sessions: BTreeMap::new(),
                dirty: false,
                active: true,
            }),
            persist_wake: Notify::new(),
            file_lock: IoMutex::new(()),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mark_dirty(&self, data: &mut Data) {
        data.dirty = true;
        self.persist_wake.notify_one();
    }

    /// Open a session for `client` under `username`, creating the profile
    /// on first sight.
    pub fn connect(
        &self,
        client: Address,
        username: &Username,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut guard = self.data.lock().unwrap();
        let data = &mut *guard;
        let profile = data
            .profiles
            .entry(username.clone())
            .or_insert_with(|| Profile::new(username.clone(), timestamp));

        if profile.sessions.len() >= MAX_SESSIONS_PER_PROFILE {
            return Err(StoreError::TooManySessions);
        }
        profile.sessions.insert(client);
        data.sessions.insert(client, username.clone());

        self.mark_dirty(data);
        Ok(())
    }

    /// Close the session at `client`, if any.  Returns whether a session
    /// was actually removed.
    pub fn disconnect(&self, client: Address, _timestamp: i64) -> bool {
        let mut data = self.data.lock().unwrap();
        let disconnected = match data.sessions.remove(&client) {
            Some(username) => {
                if let Some(profile) = data.profiles.get_mut(&username) {
                    profile.sessions.remove(&client);
                }
                true
            }
            None => false,
        };
        self.mark_dirty(&mut data);
        disconnected
    }

    /// Make the profile behind `follower_client` a follower of `followed`.
    /// Re-following is not an error.
    pub fn follow(
        &self,
        follower_client: Address,
        followed: &Username,
        _timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();

        let follower_username = data
            .sessions
            .get(&follower_client)
            .ok_or(StoreError::NoConnection)?
            .clone();
        if !data.profiles.contains_key(followed) {
            return Err(StoreError::UnknownUsername);
        }
        if follower_username == *followed {
            return Err(StoreError::CannotFollowSelf);
        }
        if let Some(profile) = data.profiles.get_mut(followed) {
            profile.followers.insert(follower_username);
        }

        self.mark_dirty(&mut data);
        Ok(())
    }

    /// Publish a notification from the profile behind `sender_client`:
    /// retain it on the sender, queue it for every follower, and emit one
    /// wake per follower on `wake`.
    pub fn notify(
        &self,
        sender_client: Address,
        message: NotifMessage,
        wake: &MailboxSender<Username>,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();

        let sender_username = data
            .sessions
            .get(&sender_client)
            .ok_or(StoreError::NoConnection)?
            .clone();
        let sender = data
            .profiles
            .get_mut(&sender_username)
            .ok_or(StoreError::UnknownUsername)?;

        sender.notif_counter += 1;
        let notif_id = sender.notif_counter;
        let followers: Vec<Username> = sender.followers.iter().cloned().collect();
        sender.received_notifs.insert(
            notif_id,
            RetainedNotif {
                id: notif_id,
                message,
                sent_at: timestamp,
                pending_count: followers.len() as u64,
            },
        );

        for follower_username in followers {
            if let Some(follower) = data.profiles.get_mut(&follower_username) {
                follower
                    .pending_notifs
                    .push_back((sender_username.clone(), notif_id));
            }
            // The mailbox send never blocks; a disconnected delivery worker
            // only happens during shutdown, when the queue is moot anyway.
            let _ = wake.send(follower_username);
        }

        self.mark_dirty(&mut data);
        Ok(())
    }

    /// Pop the oldest pending notification of `follower`, decrementing the
    /// retained copy on the sender (and dropping it once every follower
    /// has been handed theirs).  `None` when the queue is empty.
    pub fn consume_one_pending(&self, follower: &Username) -> Option<PendingNotif> {
        let mut data = self.data.lock().unwrap();

        let follower_profile = data.profiles.get_mut(follower)?;
        let (sender_username, notif_id) = follower_profile.pending_notifs.pop_front()?;
        let receivers = follower_profile.sessions.clone();

        let sender = data.profiles.get_mut(&sender_username)?;
        let notif = sender.received_notifs.get_mut(&notif_id)?;
        let pending = PendingNotif {
            sender: sender_username.clone(),
            message: notif.message.clone(),
            sent_at: notif.sent_at,
            receivers,
        };
        notif.pending_count -= 1;
        if notif.pending_count == 0 {
            sender.received_notifs.remove(&notif_id);
        }

        self.mark_dirty(&mut data);
        Some(pending)
    }

    /// Park until the store is dirty or shut down; on dirty, write a
    /// consistent snapshot.  Returns whether the store is still active,
    /// so the persistence worker runs `while store.persist_if_dirty()`.
    pub async fn persist_if_dirty(&self) -> bool {
        loop {
            let wake = self.persist_wake.notified();
            let observed = {
                let mut data = self.data.lock().unwrap();
                if data.dirty || !data.active {
                    let snapshot = data.dirty.then(|| to_bytes(&data.profiles));
                    data.dirty = false;
                    Some((snapshot, data.active))
                } else {
                    None
                }
            };

            match observed {
                Some((snapshot, active)) => {
                    if let Some(bytes) = snapshot {
                        let _io = self.file_lock.lock().await;
                        if let Err(err) = std::fs::write(&self.path, &bytes) {
                            // The dirty flag is already cleared; the next
                            // mutation re-marks it and we try again.
                            error!(
                                path = %self.path.display(),
                                %err,
                                "failed to persist server data"
                            );
                        }
                    }
                    return active;
                }
                None => wake.await,
            }
        }
    }

    /// Try to load a previously persisted snapshot.  On any failure the
    /// store is cleared to empty and `false` is returned.
    pub async fn load(&self) -> bool {
        info!(path = %self.path.display(), "attempting to load server data");
        let _io = self.file_lock.lock().await;

        let loaded = match std::fs::read(&self.path) {
            Ok(bytes) => match from_bytes::<BTreeMap<Username, Profile>>(&bytes) {
                Ok(profiles) => Some(profiles),
                Err(err) => {
                    warn!(%err, "failed to deserialize server data");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(%err, "failed to read server data file");
                None
            }
        };

        let mut data = self.data.lock().unwrap();
        match loaded {
            Some(profiles) => {
                data.profiles = profiles;
                data.sessions.clear();
                info!(profiles = data.profiles.len(), "loaded server data");
                true
            }
            None => {
                data.profiles.clear();
                data.sessions.clear();
                info!("starting with empty server data");
                false
            }
        }
    }

    /// Mark inactive and release the persistence worker.
    pub fn shutdown(&self) {
        let mut data = self.data.lock().unwrap();
        data.active = false;
        self.persist_wake.notify_one();
    }

    // -----------------------------------------------------------------------
    // Read-only views (logging, tests)
    // -----------------------------------------------------------------------

    /// The username behind a live session, if any.
    pub fn session_username(&self, client: Address) -> Option<Username> {
        self.data.lock().unwrap().sessions.get(&client).cloned()
    }

    pub fn has_profile(&self, username: &Username) -> bool {
        self.data.lock().unwrap().profiles.contains_key(username)
    }

    pub fn followers_of(&self, username: &Username) -> Option<BTreeSet<Username>> {
        self.data
            .lock()
            .unwrap()
            .profiles
            .get(username)
            .map(|profile| profile.followers.clone())
    }

    /// (entries queued across all pending deques, sum of retained pending
    /// counts).  The two agree when the store is consistent.
    pub fn pending_counts(&self) -> (u64, u64) {
        let data = self.data.lock().unwrap();
        let queued = data
            .profiles
            .values()
            .map(|profile| profile.pending_notifs.len() as u64)
            .sum();
        let retained = data
            .profiles
            .values()
            .flat_map(|profile| profile.received_notifs.values())
            .map(|notif| notif.pending_count)
            .sum();
        (queued, retained)
    }
}
