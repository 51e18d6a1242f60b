//! Block and transaction dissemination plus chain synchronization.
//!
//! Broadcast: every committed block and admitted transaction is sent
//! once to each connected peer; receivers suppress duplicates with a
//! TTL-bounded cache. Sync: a periodic round asks one peer for its tip
//! and closes any height gap with bounded range requests. A block whose
//! parent is not our tip enters fork resolution: the contested suffixes
//! are weighed by the accumulated stake of their recomputed leaders and
//! the heavier chain wins, ties broken by the lower tip hash.

use std::{sync::Arc, time::Duration};

use log::{debug, info, trace, warn};
use rand::seq::SliceRandom;
use tokio::time::timeout;

use ghostchain_common::{
    block::{Block, Height},
    crypto::Hashable,
    transaction::Transaction,
};

use crate::{
    config::{
        CHAIN_SYNC_REQUEST_MAX_BLOCKS, CHAIN_SYNC_TIMEOUT_SECS, DISCOVERY_PEER_LIMIT,
        GOSSIP_SEEN_TTL_SECS,
    },
    core::{error::BlockchainError, storage::Storage},
    p2p::packet::packet_type,
};

use super::{
    error::P2pError,
    packet::{BlockRange, Envelope, Packet, PeerResponse, SyncRequest, SyncResponse},
    peer::Peer,
    P2pServer,
};

fn seen_ttl() -> Duration {
    Duration::from_secs(GOSSIP_SEEN_TTL_SECS)
}

impl<S: Storage> P2pServer<S> {
    /// Forward chain events to the overlay: one task per channel, both
    /// terminated by the exit signal. Blocks are announced only after
    /// the chain committed them durably.
    pub(super) fn spawn_gossip_tasks(self: Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut blocks = server.get_blockchain().subscribe_blocks();
            let mut exit = server.subscribe_exit();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    block = blocks.recv() => match block {
                        Ok(block) => {
                            server
                                .check_and_mark_seen(block.get_hash().clone(), seen_ttl())
                                .await;
                            server
                                .broadcast(Packet::BlockAnnouncement((*block).clone()))
                                .await;
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        tokio::spawn(async move {
            let mut txs = self.get_blockchain().subscribe_transactions();
            let mut exit = self.subscribe_exit();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    tx = txs.recv() => match tx {
                        Ok(tx) => {
                            self.check_and_mark_seen(tx.hash(), seen_ttl()).await;
                            self.broadcast(Packet::TransactionAnnouncement((*tx).clone()))
                                .await;
                        }
                        Err(_) => break,
                    },
                }
            }
        });
    }

    /// Handle one announcement received on a unidirectional stream.
    pub(super) async fn handle_announcement(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        envelope: Envelope,
    ) -> Result<(), P2pError> {
        match envelope.packet {
            Packet::BlockAnnouncement(block) => self.on_block_announcement(peer, block).await,
            Packet::TransactionAnnouncement(tx) => self.on_tx_announcement(tx).await,
            other => Err(P2pError::UnexpectedPacket {
                expected: packet_type::BLOCK_ANNOUNCEMENT,
                got: other.tag(),
            }),
        }
    }

    async fn on_block_announcement(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        block: Block,
    ) -> Result<(), P2pError> {
        let hash = block.get_hash().clone();
        if self.check_and_mark_seen(hash.clone(), seen_ttl()).await {
            trace!("duplicate block announcement {}, suppressed", hash);
            return Ok(());
        }
        peer.set_height(peer.get_height().max(block.get_height()));
        self.apply_incoming_block(peer, block).await
    }

    async fn on_tx_announcement(self: &Arc<Self>, tx: Transaction) -> Result<(), P2pError> {
        let hash = tx.hash();
        if self.check_and_mark_seen(hash.clone(), seen_ttl()).await {
            trace!("duplicate tx announcement {}, suppressed", hash);
            return Ok(());
        }
        match self.get_blockchain().submit_transaction(Arc::new(tx)).await {
            Ok(_) => Ok(()),
            // validation and resource rejections are the peer's problem,
            // the message is simply dropped
            Err(e) if e.is_validation() => {
                debug!("rejected announced tx {}: {}", hash, e);
                Ok(())
            }
            Err(BlockchainError::MempoolFull) => {
                debug!("mempool full, dropping announced tx {}", hash);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // Apply a block that arrived by announcement or sync. The happy path
    // extends the tip; anything else is a gap or a fork.
    async fn apply_incoming_block(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        block: Block,
    ) -> Result<(), P2pError> {
        let height = block.get_height();
        let blockchain = self.get_blockchain();
        match blockchain.add_new_block(block.clone()).await {
            Ok(()) => Ok(()),
            Err(BlockchainError::InvalidBlockHeight { expected, got }) if got >= expected => {
                // the peer is ahead of us, close the gap next sync round
                debug!(
                    "block {} is {} heights ahead, deferring to sync",
                    height,
                    got - expected + 1
                );
                Ok(())
            }
            Err(BlockchainError::InvalidBlockHeight { .. }) => {
                // stale or already-known height, check for a fork
                self.try_fork_resolution(peer, &block).await
            }
            Err(BlockchainError::PreviousHashMismatch { .. }) => {
                self.try_fork_resolution(peer, &block).await
            }
            Err(e) if e.is_validation() => {
                warn!("peer {} sent an invalid block: {}", peer.get_addr(), e);
                self.mark_peer_failed(peer).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle one request received on a bidirectional stream and build
    /// its response.
    pub(super) async fn handle_request(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        envelope: Envelope,
    ) -> Result<Packet, P2pError> {
        match envelope.packet {
            Packet::BlockRequest(range) => {
                if range.span() > CHAIN_SYNC_REQUEST_MAX_BLOCKS {
                    warn!(
                        "peer {} requested {} blocks at once, closing stream",
                        peer.get_addr(),
                        range.span()
                    );
                    return Err(P2pError::RateLimited);
                }
                Ok(Packet::BlockResponse(self.collect_blocks(&range).await?))
            }
            Packet::SyncRequest(request) => {
                peer.set_height(request.latest_height);
                let (latest_height, _) = self.get_blockchain().get_chain_head().await;
                Ok(Packet::SyncResponse(SyncResponse {
                    peer_latest_height: latest_height,
                    blocks_available: latest_height > request.latest_height,
                }))
            }
            Packet::PeerDiscovery(discovery) => {
                debug!(
                    "peer discovery from {} (version {})",
                    discovery.node_id, discovery.version
                );
                let peers = self
                    .connected_peers()
                    .await
                    .iter()
                    .take(DISCOVERY_PEER_LIMIT)
                    .map(|peer| *peer.get_addr())
                    .collect();
                Ok(Packet::PeerResponse(PeerResponse {
                    node_id: self.get_node_id().clone(),
                    peers,
                }))
            }
            other => Err(P2pError::UnexpectedPacket {
                expected: packet_type::BLOCK_REQUEST,
                got: other.tag(),
            }),
        }
    }

    // Load the requested blocks; the response may be shorter than the
    // request when the range reaches past our tip
    async fn collect_blocks(&self, range: &BlockRange) -> Result<Vec<Block>, P2pError> {
        let blockchain = self.get_blockchain();
        let (latest, _) = blockchain.get_chain_head().await;
        let mut blocks = Vec::new();
        for height in range.start..=range.end.min(latest) {
            match blockchain.get_block_at_height(height).await {
                Ok(block) => blocks.push(block),
                Err(BlockchainError::BlockNotFound(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(blocks)
    }

    /// One sync round: ask a random connected peer for its tip and pull
    /// any missing range. The whole round is bounded by the sync
    /// timeout; a timed-out peer is simply retried next round.
    pub async fn sync_once(self: &Arc<Self>) {
        let peers = self.connected_peers().await;
        let Some(peer) = peers.choose(&mut rand::thread_rng()).cloned() else {
            trace!("no connected peer to sync with");
            return;
        };

        let round = self.sync_with_peer(&peer);
        match timeout(Duration::from_secs(CHAIN_SYNC_TIMEOUT_SECS), round).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("sync round with {} failed: {}", peer.get_addr(), e);
            }
            Err(_) => {
                debug!("sync round with {} timed out", peer.get_addr());
            }
        }
    }

    async fn sync_with_peer(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<(), P2pError> {
        let blockchain = self.get_blockchain();
        let (latest_height, latest_hash) = blockchain.get_chain_head().await;

        let envelope = self
            .request(
                peer,
                Packet::SyncRequest(SyncRequest {
                    latest_height,
                    latest_hash,
                }),
            )
            .await?;
        let response = match envelope.packet {
            Packet::SyncResponse(response) => response,
            other => {
                return Err(P2pError::UnexpectedPacket {
                    expected: packet_type::SYNC_RESPONSE,
                    got: other.tag(),
                })
            }
        };
        peer.set_height(response.peer_latest_height);

        if response.peer_latest_height <= latest_height || !response.blocks_available {
            trace!("peer {} is not ahead of us", peer.get_addr());
            return Ok(());
        }
        info!(
            "peer {} is at height {}, we are at {}, syncing",
            peer.get_addr(),
            response.peer_latest_height,
            latest_height
        );

        let mut current = latest_height;
        while current < response.peer_latest_height {
            let end = response
                .peer_latest_height
                .min(current + CHAIN_SYNC_REQUEST_MAX_BLOCKS);
            let blocks = self.request_blocks(peer, current + 1, end).await?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                self.apply_incoming_block(peer, block).await?;
            }
            let (new_height, _) = blockchain.get_chain_head().await;
            if new_height == current {
                // no progress, stop instead of spinning on this peer
                break;
            }
            current = new_height;
        }
        Ok(())
    }

    async fn request_blocks(
        &self,
        peer: &Arc<Peer>,
        start: Height,
        end: Height,
    ) -> Result<Vec<Block>, P2pError> {
        let envelope = self
            .request(peer, Packet::BlockRequest(BlockRange { start, end }))
            .await?;
        match envelope.packet {
            Packet::BlockResponse(blocks) => Ok(blocks),
            other => Err(P2pError::UnexpectedPacket {
                expected: packet_type::BLOCK_RESPONSE,
                got: other.tag(),
            }),
        }
    }

    // A block did not extend our tip. When its parent is a committed
    // block below the tip we have a genuine fork: fetch the peer's
    // suffix from the common ancestor, weigh both chains and adopt the
    // heavier one. An unknown parent is ignored, sync will catch up.
    async fn try_fork_resolution(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        block: &Block,
    ) -> Result<(), P2pError> {
        let blockchain = self.get_blockchain();
        let Some(common_height) = blockchain
            .get_height_for_hash(block.get_previous_hash())
            .await
        else {
            debug!(
                "block {} has an unknown parent {}, ignoring",
                block.get_hash(),
                block.get_previous_hash()
            );
            return Ok(());
        };
        let (latest_height, _) = blockchain.get_chain_head().await;
        if common_height >= latest_height {
            // parent is our tip, this was a plain race; nothing to do
            return Ok(());
        }

        let peer_latest = peer.get_height().max(block.get_height());
        info!(
            "fork detected: peer {} diverges after height {} (our tip {}, theirs {})",
            peer.get_addr(),
            common_height,
            latest_height,
            peer_latest
        );

        // pull the whole contested suffix from the peer
        let mut remote = Vec::new();
        let mut start = common_height + 1;
        while start <= peer_latest {
            let end = peer_latest.min(start + CHAIN_SYNC_REQUEST_MAX_BLOCKS - 1);
            let blocks = self.request_blocks(peer, start, end).await?;
            let Some(last) = blocks.last() else { break };
            start = last.get_height() + 1;
            remote.extend(blocks);
        }
        if remote.is_empty() {
            return Ok(());
        }

        let verdict = match blockchain.evaluate_fork(common_height, &remote).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("peer {} sent an invalid fork suffix: {}", peer.get_addr(), e);
                self.mark_peer_failed(peer).await;
                return Ok(());
            }
        };
        if !verdict.adopt {
            info!(
                "keeping local chain: local weight {} >= remote weight {}",
                verdict.local_weight, verdict.remote_weight
            );
            return Ok(());
        }

        info!(
            "adopting remote chain: remote weight {} > local weight {}",
            verdict.remote_weight, verdict.local_weight
        );
        if let Err(e) = blockchain.resolve_fork(common_height, remote).await {
            warn!("fork adoption failed, local chain retained: {}", e);
            self.mark_peer_failed(peer).await;
        }
        Ok(())
    }
}
