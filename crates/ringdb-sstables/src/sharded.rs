//! A group of directory managers, one actor per shard.
//!
//! Shards share no state. Each one owns its [`SstableDirectory`] inside a
//! tokio task and is driven through a mailbox; everything crossing a shard
//! boundary is an encoded [`ForeignSstableOpenInfo`] list. The group plays
//! the barrier of the two-phase commit: every shard votes, and a single
//! failed vote aborts the commit everywhere.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionConfig, CompactionStopHandle};
use crate::directory::{DirectoryConfig, DirectorySnapshot, SstableDirectory};
use crate::error::{SstError, SstResult};
use crate::io::{CompactionTable, CreatorRef, OutputHandoff, SstableIo};
use crate::ownership::ShardId;
use crate::reshape::ReshapeConfig;
use crate::sstable::{decode_open_infos, encode_open_infos, ForeignSstableOpenInfo};

/// Messages understood by a shard actor.
enum Command {
    Process {
        reply: oneshot::Sender<SstResult<()>>,
    },
    TakeRemote {
        reply: oneshot::Sender<SstResult<Vec<(ShardId, Vec<u8>)>>>,
    },
    LoadForeign {
        payload: Vec<u8>,
        reply: oneshot::Sender<SstResult<()>>,
    },
    FinishExchange {
        reply: oneshot::Sender<SstResult<()>>,
    },
    PrepareCommit {
        reply: oneshot::Sender<SstResult<()>>,
    },
    Commit {
        reply: oneshot::Sender<SstResult<()>>,
    },
    Abort {
        reply: oneshot::Sender<()>,
    },
    Reshard {
        peers: Vec<ShardHandle>,
        config: CompactionConfig,
        reply: oneshot::Sender<SstResult<()>>,
    },
    /// Resharded output from a peer; fire and forget, failures surface at
    /// the next barrier.
    CollectResharded {
        from: ShardId,
        payload: Vec<u8>,
    },
    /// Replies with the senders whose output could not be collected.
    Barrier {
        reply: oneshot::Sender<Vec<(ShardId, SstError)>>,
    },
    FinishReshard {
        collected: bool,
        reply: oneshot::Sender<()>,
    },
    Reshape {
        config: ReshapeConfig,
        stop: CompactionStopHandle,
        reply: oneshot::Sender<SstResult<u64>>,
    },
    Snapshot {
        reply: oneshot::Sender<DirectorySnapshot>,
    },
    Shutdown,
}

/// Mailbox of one shard actor.
#[derive(Clone)]
pub struct ShardHandle {
    shard: ShardId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ShardHandle {
    /// Shard behind this mailbox.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    fn send(&self, command: Command) -> SstResult<()> {
        self.tx.send(command).map_err(|_| SstError::ShardUnavailable {
            shard: self.shard.as_u32(),
        })
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> SstResult<R> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SstError::ShardUnavailable {
            shard: self.shard.as_u32(),
        })
    }
}

/// Delivers resharded output into the owner's mailbox.
struct PeerHandoff {
    from: ShardId,
    peers: Vec<ShardHandle>,
}

impl OutputHandoff for PeerHandoff {
    async fn hand_off(&self, shard: ShardId, infos: Vec<ForeignSstableOpenInfo>) -> SstResult<()> {
        let peer = self.peers.get(shard.index()).ok_or(SstError::ShardUnavailable {
            shard: shard.as_u32(),
        })?;
        let payload = encode_open_infos(&infos)?;
        debug!(to = shard.as_u32(), count = infos.len(), "handing off resharded sstables");
        peer.send(Command::CollectResharded {
            from: self.from,
            payload,
        })
    }
}

struct ShardActor<Io, T: ?Sized> {
    directory: SstableDirectory<Io>,
    table: Arc<T>,
    creator: CreatorRef,
    collect_errors: Vec<(ShardId, SstError)>,
}

impl<Io, T> ShardActor<Io, T>
where
    Io: SstableIo,
    T: CompactionTable + ?Sized + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let shard = self.directory.shard();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Process { reply } => {
                    let _ = reply.send(self.directory.process_sstable_dir().await);
                }
                Command::TakeRemote { reply } => {
                    let _ = reply.send(self.take_remote());
                }
                Command::LoadForeign { payload, reply } => {
                    let result = match decode_open_infos(&payload) {
                        Ok(infos) => self.directory.load_foreign_sstables(infos).await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                Command::FinishExchange { reply } => {
                    let _ = reply.send(self.directory.finish_exchange());
                }
                Command::PrepareCommit { reply } => {
                    let _ = reply.send(self.directory.prepare_commit());
                }
                Command::Commit { reply } => {
                    let _ = reply.send(self.directory.commit_directory_changes().await);
                }
                Command::Abort { reply } => {
                    self.directory.abort();
                    let _ = reply.send(());
                }
                Command::Reshard {
                    peers,
                    config,
                    reply,
                } => {
                    let handoff = PeerHandoff { from: shard, peers };
                    let result = self
                        .directory
                        .reshard(self.table.as_ref(), self.creator.clone(), &handoff, &config)
                        .await;
                    let _ = reply.send(result);
                }
                Command::CollectResharded { from, payload } => {
                    let result = match decode_open_infos(&payload) {
                        Ok(infos) => self.directory.collect_resharded_sstables(infos).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        error!(
                            shard = shard.as_u32(),
                            from = from.as_u32(),
                            "failed to collect resharded sstables: {}",
                            e
                        );
                        self.collect_errors.push((from, e));
                    }
                }
                Command::Barrier { reply } => {
                    let _ = reply.send(std::mem::take(&mut self.collect_errors));
                }
                Command::FinishReshard { collected, reply } => {
                    if collected {
                        self.directory.complete_reshard();
                    } else {
                        self.directory.rollback_reshard();
                    }
                    let _ = reply.send(());
                }
                Command::Reshape {
                    config,
                    stop,
                    reply,
                } => {
                    let result = self
                        .directory
                        .reshape(self.table.as_ref(), self.creator.clone(), &config, &stop)
                        .await;
                    let _ = reply.send(result);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.directory.snapshot());
                }
                Command::Shutdown => break,
            }
        }
        debug!(shard = shard.as_u32(), "shard actor stopped");
    }

    fn take_remote(&mut self) -> SstResult<Vec<(ShardId, Vec<u8>)>> {
        let remote = self.directory.take_remote_sstables()?;
        remote
            .into_iter()
            .map(|(owner, infos)| Ok((owner, encode_open_infos(&infos)?)))
            .collect()
    }
}

fn first_error<R>(results: Vec<SstResult<SstResult<R>>>) -> SstResult<Vec<R>> {
    results.into_iter().map(|r| r.and_then(|inner| inner)).collect()
}

/// Directory managers for every shard of one table directory.
pub struct ShardedDirectory {
    shards: Vec<ShardHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShardedDirectory {
    /// Starts one actor per shard. `make_io` supplies each shard's storage
    /// backend. Must be called inside a tokio runtime.
    pub fn spawn<Io, T, F>(
        dir: impl Into<PathBuf>,
        shard_count: u32,
        config: DirectoryConfig,
        table: Arc<T>,
        creator: CreatorRef,
        mut make_io: F,
    ) -> Self
    where
        Io: SstableIo,
        T: CompactionTable + ?Sized + 'static,
        F: FnMut(ShardId) -> Io,
    {
        let dir = dir.into();
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count as usize);
        let mut tasks = Vec::with_capacity(shard_count as usize);
        for id in 0..shard_count {
            let shard = ShardId::new(id);
            let (tx, rx) = mpsc::unbounded_channel();
            let actor = ShardActor {
                directory: SstableDirectory::new(dir.clone(), shard, shard_count, config.clone(), make_io(shard)),
                table: Arc::clone(&table),
                creator: creator.clone(),
                collect_errors: Vec::new(),
            };
            tasks.push(tokio::spawn(actor.run(rx)));
            shards.push(ShardHandle { shard, tx });
        }
        info!(dir = %dir.display(), shard_count, "sharded directory started");
        Self { shards, tasks }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Mailbox of one shard.
    pub fn handle(&self, shard: ShardId) -> Option<&ShardHandle> {
        self.shards.get(shard.index())
    }

    async fn broadcast<R, F>(&self, make: F) -> Vec<SstResult<R>>
    where
        F: Fn(oneshot::Sender<R>) -> Command,
    {
        join_all(self.shards.iter().map(|h| h.call(&make))).await
    }

    /// Scans the directory on every shard.
    pub async fn process_all(&self) -> SstResult<()> {
        first_error(self.broadcast(|reply| Command::Process { reply }).await)?;
        Ok(())
    }

    /// Sends every shard's foreign SSTables to their owners, then closes the
    /// exchange everywhere.
    pub async fn move_foreign_sstables(&self) -> SstResult<()> {
        let outgoing = first_error(self.broadcast(|reply| Command::TakeRemote { reply }).await)?;
        let mut inbound: BTreeMap<ShardId, Vec<Vec<u8>>> = BTreeMap::new();
        for (owner, payload) in outgoing.into_iter().flatten() {
            inbound.entry(owner).or_default().push(payload);
        }

        let deliveries = inbound.into_iter().map(|(owner, payloads)| async move {
            let handle = self.handle(owner).ok_or(SstError::ShardUnavailable {
                shard: owner.as_u32(),
            })?;
            for payload in payloads {
                handle
                    .call(|reply| Command::LoadForeign { payload, reply })
                    .await??;
            }
            Ok::<_, SstError>(())
        });
        let delivered: SstResult<Vec<()>> = join_all(deliveries).await.into_iter().collect();

        let finished = first_error(self.broadcast(|reply| Command::FinishExchange { reply }).await);
        delivered?;
        finished?;
        Ok(())
    }

    /// Two-phase commit of the collected removals. Every shard votes first;
    /// if any vote fails, every shard aborts and nothing is deleted.
    pub async fn commit_all(&self) -> SstResult<()> {
        let votes = self.broadcast(|reply| Command::PrepareCommit { reply }).await;
        if let Err(e) = first_error(votes) {
            warn!("commit vote failed, aborting on every shard: {}", e);
            self.abort_all().await;
            return Err(SstError::CommitAborted {
                reason: e.to_string(),
            });
        }
        first_error(self.broadcast(|reply| Command::Commit { reply }).await)?;
        Ok(())
    }

    /// Drops pending removals on every shard.
    pub async fn abort_all(&self) {
        for result in self.broadcast(|reply| Command::Abort { reply }).await {
            if let Err(e) = result {
                warn!("abort not delivered: {}", e);
            }
        }
    }

    /// Reshards every shard's shared set. Outputs reach their owners
    /// through the owners' mailboxes. A barrier then reports which senders
    /// had output rejected: their inputs go back to the shared set, while
    /// every other shard retires its inputs.
    pub async fn reshard_all(&self, config: &CompactionConfig) -> SstResult<()> {
        let resharded = first_error(
            self.broadcast(|reply| Command::Reshard {
                peers: self.shards.clone(),
                config: config.clone(),
                reply,
            })
            .await,
        );

        let mut uncollected: BTreeSet<ShardId> = BTreeSet::new();
        let mut unreachable = false;
        let mut collect_error = None;
        for result in self.broadcast(|reply| Command::Barrier { reply }).await {
            match result {
                Ok(failures) => {
                    for (from, e) in failures {
                        uncollected.insert(from);
                        collect_error.get_or_insert(e);
                    }
                }
                Err(e) => {
                    unreachable = true;
                    collect_error.get_or_insert(e);
                }
            }
        }

        // A shard missing from the barrier may have dropped anyone's output.
        let finishes = self.shards.iter().map(|handle| {
            let collected = !unreachable && !uncollected.contains(&handle.shard());
            if !collected {
                warn!(shard = handle.shard().as_u32(), "rolling back resharded batches");
            }
            handle.call(move |reply| Command::FinishReshard { collected, reply })
        });
        let finished: SstResult<Vec<()>> = join_all(finishes).await.into_iter().collect();

        resharded?;
        if let Some(e) = collect_error {
            return Err(e);
        }
        finished?;
        Ok(())
    }

    /// Reshapes every shard and returns the total bytes rewritten.
    pub async fn reshape_all(&self, config: &ReshapeConfig, stop: &CompactionStopHandle) -> SstResult<u64> {
        let rewritten = first_error(
            self.broadcast(|reply| Command::Reshape {
                config: config.clone(),
                stop: stop.clone(),
                reply,
            })
            .await,
        )?;
        Ok(rewritten.into_iter().sum())
    }

    /// State of every shard, in shard order.
    pub async fn snapshot(&self) -> SstResult<Vec<DirectorySnapshot>> {
        self.broadcast(|reply| Command::Snapshot { reply })
            .await
            .into_iter()
            .collect()
    }

    /// Stops every actor and waits for them.
    pub async fn shutdown(self) {
        for handle in &self.shards {
            let _ = handle.send(Command::Shutdown);
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("shard actor panicked: {}", e);
            }
        }
    }
}
