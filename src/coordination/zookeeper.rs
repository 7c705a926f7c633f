//! ZooKeeper-backed coordination, shared by every engine process pointed at
//! the same ensemble.
//!
//! Elections follow the usual recipe: each candidate creates an
//! ephemeral-sequential node under the election path, the lowest sequence
//! leads and every other candidate watches the node just ahead of its own.
//!
//! The queue keeps items as persistent-sequential nodes under
//! `{path}/entries`. A checkout is an ephemeral node of the same name under
//! `{path}/taken`, so it lives exactly as long as the consumer's session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;
use zookeeper_client as zk;

use crate::coordination::{
    CoordinationError, LeaderElection, Leadership, LockingQueue, QueueEntry,
};

/// Name prefix of queue items. The priority field keeps entries written by
/// other queue clients sorting in the same order.
const ENTRY_PREFIX: &str = "entry-100-";
const CANDIDATE_PREFIX: &str = "candidate-";

impl From<zk::Error> for CoordinationError {
    fn from(e: zk::Error) -> Self {
        CoordinationError::Unavailable(e.to_string())
    }
}

fn persistent() -> zk::CreateOptions<'static> {
    zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all())
}

fn persistent_sequential() -> zk::CreateOptions<'static> {
    zk::CreateMode::PersistentSequential.with_acls(zk::Acls::anyone_all())
}

fn ephemeral() -> zk::CreateOptions<'static> {
    zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all())
}

fn ephemeral_sequential() -> zk::CreateOptions<'static> {
    zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all())
}

/// Creates `path` and its missing parents.
async fn ensure_path(client: &zk::Client, path: &str) -> Result<(), CoordinationError> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        match client.create(&current, &[], &persistent()).await {
            Ok(_) | Err(zk::Error::NodeExists) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Deletes `path` in the background. Used from `Drop`, where nothing can be
/// awaited; an ephemeral node left behind disappears with the session anyway.
fn delete_detached(client: &zk::Client, path: &str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let client = client.clone();
    let path = path.to_string();
    handle.spawn(async move {
        match client.delete(&path, None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => tracing::warn!(path = %path, error = %e, "Failed to delete coordination node"),
        }
    });
}

/// Sequence number ZooKeeper appended to a sequential node name.
fn sequence(name: &str) -> Option<u64> {
    name.rsplit('-').next()?.parse().ok()
}

/// Where a candidate stands in an election.
#[derive(Debug, PartialEq, Eq)]
enum Standing<'a> {
    Leading,
    /// Waiting for the given node to go away.
    Behind(&'a str),
    /// The candidate's own node is gone.
    Vanished,
}

fn standing<'a>(children: &'a [String], own: &str) -> Standing<'a> {
    let Some(own_sequence) = sequence(own) else {
        return Standing::Vanished;
    };
    if !children.iter().any(|c| c == own) {
        return Standing::Vanished;
    }

    children
        .iter()
        .filter(|c| c.starts_with(CANDIDATE_PREFIX))
        .filter_map(|c| Some((sequence(c)?, c.as_str())))
        .filter(|(seq, _)| *seq < own_sequence)
        .max_by_key(|(seq, _)| *seq)
        .map_or(Standing::Leading, |(_, name)| Standing::Behind(name))
}

/// Client shared by all elections and queues of one process.
pub struct ZkCoordinator {
    client: zk::Client,
}

impl ZkCoordinator {
    /// Connects to `hosts` (`host:port[,host:port...]`).
    pub async fn connect(hosts: &str) -> Result<Arc<Self>, CoordinationError> {
        let client = zk::Client::connect(hosts).await?;
        tracing::info!(hosts, "Connected to ZooKeeper");
        Ok(Arc::new(Self { client }))
    }

    /// The queue at `path`, created when missing.
    pub async fn queue(&self, path: &str) -> Result<Arc<ZkQueue>, CoordinationError> {
        let queue = ZkQueue {
            client: self.client.clone(),
            path: path.to_string(),
            entries: format!("{}/entries", path),
            taken: format!("{}/taken", path),
            owner: Uuid::new_v4().to_string(),
            held: DashMap::new(),
            next_token: AtomicU64::new(0),
        };
        ensure_path(&self.client, &queue.entries).await?;
        ensure_path(&self.client, &queue.taken).await?;
        Ok(Arc::new(queue))
    }

    /// Completes once the session can no longer be used. Every ephemeral
    /// node, leadership and checkout this process held is gone by then.
    pub async fn session_ended(&self) -> zk::SessionState {
        let mut states = self.client.state_watcher();
        loop {
            let state = states.changed().await;
            if matches!(
                state,
                zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed
            ) {
                return state;
            }
        }
    }
}

/// A candidate node that is deleted again unless it turns into leadership.
struct CandidateNode {
    client: zk::Client,
    path: String,
    armed: bool,
}

impl Drop for CandidateNode {
    fn drop(&mut self) {
        if self.armed {
            delete_detached(&self.client, &self.path);
        }
    }
}

#[async_trait]
impl LeaderElection for ZkCoordinator {
    async fn campaign(
        &self,
        election: &str,
        participant: &str,
    ) -> Result<Box<dyn Leadership>, CoordinationError> {
        ensure_path(&self.client, election).await?;

        let prefix = format!("{}{}-", CANDIDATE_PREFIX, Uuid::new_v4().simple());
        self.client
            .create(
                &format!("{}/{}", election, prefix),
                participant.as_bytes(),
                &ephemeral_sequential(),
            )
            .await?;

        let children = self.client.list_children(election).await?;
        let own = children
            .into_iter()
            .find(|c| c.starts_with(&prefix))
            .ok_or_else(|| CoordinationError::Unavailable(format!("candidate node {} vanished", prefix)))?;
        let mut node = CandidateNode {
            client: self.client.clone(),
            path: format!("{}/{}", election, own),
            armed: true,
        };

        loop {
            let children = self.client.list_children(election).await?;
            match standing(&children, &own) {
                Standing::Leading => {
                    tracing::debug!(election, participant, node = %node.path, "Election won");
                    node.armed = false;
                    return Ok(Box::new(ZkLeadership {
                        client: self.client.clone(),
                        node: node.path.clone(),
                        resigned: false,
                    }));
                }
                Standing::Behind(ahead) => {
                    let ahead = format!("{}/{}", election, ahead);
                    let (stat, watcher) = self.client.check_and_watch_stat(&ahead).await?;
                    if stat.is_some() {
                        watcher.changed().await;
                    }
                }
                Standing::Vanished => {
                    node.armed = false;
                    return Err(CoordinationError::Unavailable(format!(
                        "candidate node {} vanished",
                        node.path
                    )));
                }
            }
        }
    }
}

struct ZkLeadership {
    client: zk::Client,
    node: String,
    resigned: bool,
}

#[async_trait]
impl Leadership for ZkLeadership {
    async fn lost(&mut self) {
        loop {
            match self.client.check_and_watch_stat(&self.node).await {
                Ok((Some(_), watcher)) => {
                    watcher.changed().await;
                }
                Ok((None, _)) => return,
                Err(e) => {
                    tracing::warn!(node = %self.node, error = %e, "Cannot confirm leadership");
                    return;
                }
            }
        }
    }

    async fn resign(mut self: Box<Self>) {
        self.resigned = true;
        match self.client.delete(&self.node, None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => tracing::warn!(node = %self.node, error = %e, "Failed to resign"),
        }
    }
}

impl Drop for ZkLeadership {
    fn drop(&mut self) {
        if !self.resigned {
            delete_detached(&self.client, &self.node);
        }
    }
}

/// [`LockingQueue`] over ZooKeeper nodes.
pub struct ZkQueue {
    client: zk::Client,
    path: String,
    entries: String,
    taken: String,
    /// Written into every checkout node this queue handle creates.
    owner: String,
    /// Entry name behind each token handed out.
    held: DashMap<u64, String>,
    next_token: AtomicU64,
}

impl ZkQueue {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn taken_path(&self, name: &str) -> String {
        format!("{}/{}", self.taken, name)
    }

    /// Tries to check out entry `name`. `None` when someone else holds it or
    /// it was consumed in the meantime.
    async fn try_take(&self, name: &str) -> Result<Option<QueueEntry>, CoordinationError> {
        let lock = self.taken_path(name);
        match self.client.create(&lock, self.owner.as_bytes(), &ephemeral()).await {
            Ok(_) => {}
            Err(zk::Error::NodeExists) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match self.client.get_data(&format!("{}/{}", self.entries, name)).await {
            Ok((data, _)) => {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
                self.held.insert(token, name.to_string());
                Ok(Some(QueueEntry::new(token, String::from_utf8_lossy(&data))))
            }
            Err(read_error) => {
                if let Err(e) = self.client.delete(&lock, None).await {
                    tracing::warn!(node = %lock, error = %e, "Failed to drop checkout of vanished entry");
                }
                match read_error {
                    zk::Error::NoNode => Ok(None),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Entry name for `entry`, if this handle still owns its checkout.
    async fn owned(&self, entry: &QueueEntry) -> Result<String, CoordinationError> {
        let name = self
            .held
            .get(&entry.token())
            .map(|n| n.value().clone())
            .ok_or(CoordinationError::StaleEntry(entry.token()))?;

        match self.client.get_data(&self.taken_path(&name)).await {
            Ok((owner, _)) if owner == self.owner.as_bytes() => Ok(name),
            Ok(_) | Err(zk::Error::NoNode) => {
                self.held.remove(&entry.token());
                Err(CoordinationError::StaleEntry(entry.token()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LockingQueue for ZkQueue {
    async fn put(&self, item: String) -> Result<(), CoordinationError> {
        self.client
            .create(
                &format!("{}/{}", self.entries, ENTRY_PREFIX),
                item.as_bytes(),
                &persistent_sequential(),
            )
            .await?;
        Ok(())
    }

    async fn get(&self) -> Result<QueueEntry, CoordinationError> {
        loop {
            let (mut names, entries_changed) = self.client.list_and_watch_children(&self.entries).await?;
            let (taken, taken_changed) = self.client.list_and_watch_children(&self.taken).await?;
            let taken: HashSet<String> = taken.into_iter().collect();
            names.sort();

            for name in names.iter().filter(|n| !taken.contains(*n)) {
                if let Some(entry) = self.try_take(name).await? {
                    return Ok(entry);
                }
            }

            tokio::select! {
                _ = entries_changed.changed() => {}
                _ = taken_changed.changed() => {}
            }
        }
    }

    async fn consume(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        let name = self.owned(entry).await?;
        match self.client.delete(&format!("{}/{}", self.entries, name), None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => return Err(e.into()),
        }
        match self.client.delete(&self.taken_path(&name), None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => return Err(e.into()),
        }
        self.held.remove(&entry.token());
        Ok(())
    }

    async fn release(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        let name = self.owned(entry).await?;
        match self.client.delete(&self.taken_path(&name), None).await {
            Ok(()) | Err(zk::Error::NoNode) => {}
            Err(e) => return Err(e.into()),
        }
        self.held.remove(&entry.token());
        Ok(())
    }

    /// Checkouts live as long as the session; renewing only confirms that
    /// this handle still owns the checkout.
    async fn renew(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        self.owned(entry).await.map(|_| ())
    }
}
