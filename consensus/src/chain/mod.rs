//! The block-tree manager.
//!
//! [`ChainManager`] receives candidate blocks from untrusted peers,
//! links them under the genesis-rooted tree held by the block store,
//! keeps the branch with the most cumulative work as the best chain and
//! tells listeners about confirmed transactions and reorganizations.
//!
//! The chain is a tree, though in normal operation it behaves like a
//! list. When two miners solve a block within seconds of each other the
//! tree briefly carries competing tips; a block landing on a non-best
//! tip with more total work triggers a reorganize. Blocks whose parent
//! is unknown wait in a bounded orphan pool and are retried whenever an
//! add succeeds.

mod backend;
mod orphans;
mod reorg;

pub use backend::{ChainBackend, FullValidationBackend, HeaderOnlyBackend};
pub use orphans::{FilteredData, DEFAULT_ORPHAN_CAPACITY};

use consensus_core::errors::VerificationError;
use consensus_core::{
    Block, BlockHeader, Hash, NetworkParams, StoredBlock, Transaction,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::difficulty;
use crate::error::ChainError;
use crate::listener::{ChainListener, ListenerExecutor, ListenerRegistration, NewBlockType};
use crate::store::{BlockStore, UndoableBlockStore};
use orphans::{OrphanBlock, OrphanPool};

/// State mutated only under the broad chain lock.
struct ChainState {
    orphans: OrphanPool,
    fp: crate::fp::FalsePositiveEstimator,
    height_waiters: Vec<(u64, oneshot::Sender<StoredBlock>)>,
    stats_last_time: Instant,
    stats_blocks_added: u64,
}

/// The chain engine. Thread safe; every mutating operation runs under
/// one exclusive lock, while the chain-head pointer sits behind its own
/// narrow lock so readers stay fast during block download.
pub struct ChainManager {
    params: Arc<NetworkParams>,
    backend: Arc<dyn ChainBackend>,
    state: Mutex<ChainState>,
    chain_head: RwLock<StoredBlock>,
    listeners: RwLock<Vec<ListenerRegistration>>,
}

impl ChainManager {
    /// Creates a chain manager over an arbitrary backend. The store
    /// behind the backend must already hold a chain head.
    pub fn new(params: Arc<NetworkParams>, backend: Arc<dyn ChainBackend>) -> Result<Self, ChainError> {
        let chain_head = backend.get_chain_head()?;
        info!("chain head is at height {}: {}", chain_head.height(), chain_head.hash());
        Ok(Self {
            params,
            backend,
            state: Mutex::new(ChainState {
                orphans: OrphanPool::new(DEFAULT_ORPHAN_CAPACITY),
                fp: crate::fp::FalsePositiveEstimator::new(),
                height_waiters: Vec::new(),
                stats_last_time: Instant::now(),
                stats_blocks_added: 0,
            }),
            chain_head: RwLock::new(chain_head),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Header-only (SPV) operation over `store`.
    pub fn header_only(params: Arc<NetworkParams>, store: Arc<dyn BlockStore>) -> Result<Self, ChainError> {
        Self::new(params, Arc::new(HeaderOnlyBackend::new(store)))
    }

    /// Full verification over an undoable `store`.
    pub fn full_validation(
        params: Arc<NetworkParams>,
        store: Arc<dyn UndoableBlockStore>,
    ) -> Result<Self, ChainError> {
        Self::new(params, Arc::new(FullValidationBackend::new(store)))
    }

    /// Registers a listener. Inline listeners run on the adding thread
    /// and take part in relevance probing and false-positive tracking.
    pub fn add_listener(&self, listener: Arc<dyn ChainListener>, executor: ListenerExecutor) {
        self.listeners.write().unwrap().push(ListenerRegistration { listener, executor });
    }

    /// Unregisters a listener previously passed to
    /// [`ChainManager::add_listener`].
    pub fn remove_listener(&self, listener: &Arc<dyn ChainListener>) {
        self.listeners
            .write()
            .unwrap()
            .retain(|registration| !Arc::ptr_eq(&registration.listener, listener));
    }

    /// Processes a received block and tries to add it to the chain.
    /// Returns `true` if the block was linked (best chain or side
    /// branch), `false` if it was buffered as an orphan. Consensus
    /// violations surface as [`ChainError::Invalid`] after the store
    /// has been rolled back.
    pub fn add_block(&self, block: Block) -> Result<bool, ChainError> {
        self.add_rolling_back_on_failure(block, None)
    }

    /// Processes a bloom-filtered block: a header, the matched
    /// transaction ids in block order, and whichever of the matched
    /// transactions were actually relayed. Not available in full
    /// verification mode.
    pub fn add_filtered_block(
        &self,
        header: BlockHeader,
        tx_hashes: Vec<Hash>,
        transactions: HashMap<Hash, Transaction>,
    ) -> Result<bool, ChainError> {
        if self.backend.should_verify_transactions() {
            return Err(VerificationError::FilteredBlock.into());
        }
        self.add_rolling_back_on_failure(
            Block::from_header(header),
            Some(FilteredData { tx_hashes, transactions }),
        )
    }

    fn add_rolling_back_on_failure(
        &self,
        block: Block,
        filtered: Option<FilteredData>,
    ) -> Result<bool, ChainError> {
        let hash = block.hash();
        let mut state = self.state.lock().unwrap();
        match self.add_inner(&mut state, block, true, filtered) {
            Err(err @ ChainError::Invalid(_)) => {
                error!("could not verify block {}: {}", hash, err);
                // Abort whatever store transaction the failed add may
                // have opened; the call is idempotent.
                self.backend.not_setting_chain_head()?;
                Err(err)
            }
            other => other,
        }
    }

    fn add_inner(
        &self,
        state: &mut ChainState,
        block: Block,
        try_connecting: bool,
        filtered: Option<FilteredData>,
    ) -> Result<bool, ChainError> {
        if state.stats_last_time.elapsed() > Duration::from_secs(1) {
            // More than a second passed since last stats logging.
            if state.stats_blocks_added > 1 {
                info!("{} blocks per second", state.stats_blocks_added);
            }
            state.stats_last_time = Instant::now();
            state.stats_blocks_added = 0;
        }

        // Quick duplicate checks, cheaper than the split-point search
        // they would otherwise reach.
        let hash = block.hash();
        if hash == self.chain_head().hash() {
            return Ok(true);
        }
        if try_connecting && state.orphans.contains(&hash) {
            return Ok(false);
        }

        if self.backend.should_verify_transactions() {
            if block.transactions.is_none() {
                return Err(VerificationError::HeaderOnlyBlock.into());
            }
            // Check for an already-seen block; only in full mode, where
            // the database answers this quickly.
            if self.backend.get(&hash)?.is_some() {
                return Ok(true);
            }
        }

        // Decide up front whether the contents matter, so merkle-root
        // verification can be skipped for blocks nobody cares about.
        let mut contents_important = self.backend.should_verify_transactions();
        if block.transactions.is_some() {
            contents_important = contents_important || self.contains_relevant_transactions(&block);
        }

        let verified = block
            .verify_header(&self.params)
            .and_then(|()| if contents_important { block.verify_transactions() } else { Ok(()) });
        if let Err(err) = verified {
            error!("failed to verify block {}: {}", hash, err);
            return Err(err.into());
        }

        // Try linking it to a place in the currently known blocks.
        match self.backend.block_in_scope(&block.header.prev_block_hash)? {
            None => {
                // Probably still downloading the chain; set the block
                // aside until the parent shows up.
                debug_assert!(try_connecting, "orphan drain produced an orphan");
                warn!("block does not connect: {} prev {}", hash, block.header.prev_block_hash);
                let orphan =
                    OrphanBlock::new(block, filtered, self.backend.should_verify_transactions());
                state.orphans.insert(hash, orphan);
                return Ok(false);
            }
            Some(stored_prev) => {
                // It connects somewhere on the tree, not necessarily at
                // the top of the best chain.
                difficulty::check_difficulty_transitions(
                    &stored_prev,
                    &block.header,
                    &self.params,
                    self.backend.as_ref(),
                )?;
                self.connect_block(state, &block, stored_prev, filtered.as_ref())?;
            }
        }

        if try_connecting {
            self.try_connecting_orphans(state)?;
        }

        state.stats_blocks_added += 1;
        Ok(true)
    }

    fn connect_block(
        &self,
        state: &mut ChainState,
        block: &Block,
        stored_prev: StoredBlock,
        filtered: Option<&FilteredData>,
    ) -> Result<(), ChainError> {
        let height = stored_prev.height() + 1;
        if !self.params.passes_checkpoint(height, &block.hash()) {
            return Err(VerificationError::CheckpointMismatch(height).into());
        }
        if self.backend.should_verify_transactions() {
            for tx in block.transactions.iter().flatten() {
                if !tx.is_final(height, block.header.timestamp) {
                    return Err(VerificationError::NonFinalTransaction.into());
                }
            }
        }

        let head = self.chain_head();
        if stored_prev.hash() == head.hash() {
            // Normal continuation at the top of the best chain.
            if let Some(data) = filtered {
                if !data.transactions.is_empty() {
                    debug!(
                        "block {} connects to top of best chain with {} transaction(s) of which we were sent {}",
                        block.hash(),
                        data.tx_hashes.len(),
                        data.transactions.len()
                    );
                }
            }
            let expensive_checks = self.backend.should_verify_transactions();
            if expensive_checks {
                let median = reorg::median_timestamp_of_recent(&head, self.backend.as_ref())?;
                if block.header.timestamp <= median {
                    return Err(VerificationError::TimestampTooEarly.into());
                }
            }

            let tx_out_changes = if self.backend.should_verify_transactions() {
                Some(self.backend.connect_transactions(height, block)?)
            } else {
                None
            };
            let to_store =
                if block.transactions.is_none() { block.clone() } else { block.as_header_block() };
            let new_stored =
                self.backend.add_to_block_store(&stored_prev, &to_store, tx_out_changes.as_ref())?;
            self.set_chain_head(state, new_stored)?;
            debug!("chain is now {} blocks high, running listeners", new_stored.height());
            self.inform_listeners_for_new_block(state, block, NewBlockType::BestChain, filtered, &new_stored);
        } else {
            // The block connects somewhere other than the top of the
            // best chain. Listeners see the transactions as SIDE_CHAIN
            // first even when a reorganize is about to promote them;
            // that ordering keeps wallet bookkeeping simple.
            let new_block = stored_prev.build(block.header);
            let have_new_best_chain = new_block.more_work_than(&head);
            if have_new_best_chain {
                info!("block is causing a re-organize");
            } else {
                let split_point = reorg::find_split(&new_block, &head, self.backend.as_ref())?;
                if split_point.hash() == new_block.hash() {
                    // A block we already saw and linked into the chain,
                    // below the head. Re-processing would confuse
                    // wallets, so skip.
                    warn!(
                        "saw duplicated block in main chain at height {}: {}",
                        new_block.height(),
                        new_block.hash()
                    );
                    return Ok(());
                }
                // Not spending anything yet; the block sits on a fork.
                self.backend.add_to_block_store(&stored_prev, block, None)?;
                info!(
                    "block forks the chain at height {}/block {}, but it did not cause a reorganize: {}",
                    split_point.height(),
                    split_point.hash(),
                    new_block.hash()
                );
            }

            // During fast catchup we may have only a header; if there
            // are transactions, wallets must hold them unspendable
            // until the branch activates.
            if block.transactions.is_some() || filtered.is_some() {
                self.inform_listeners_for_new_block(state, block, NewBlockType::SideChain, filtered, &new_block);
            }

            if have_new_best_chain {
                self.handle_new_best_chain(state, stored_prev, new_block, block)?;
            }
        }
        Ok(())
    }

    /// Called when a block lands on a side branch whose total work now
    /// exceeds the best chain's: disconnect back to the split point,
    /// connect the new branch in chronological order, tell every
    /// listener, move the head.
    fn handle_new_best_chain(
        &self,
        state: &mut ChainState,
        stored_prev: StoredBlock,
        new_chain_head: StoredBlock,
        block: &Block,
    ) -> Result<(), ChainError> {
        let head = self.chain_head();
        let split_point = reorg::find_split(&new_chain_head, &head, self.backend.as_ref())?;
        info!("re-organize after split at height {}", split_point.height());
        info!("old chain head: {}", head.hash());
        info!("new chain head: {}", new_chain_head.hash());
        info!("split at block: {}", split_point.hash());

        let old_blocks = reorg::partial_chain(&head, &split_point, self.backend.as_ref())?;
        let new_blocks = reorg::partial_chain(&new_chain_head, &split_point, self.backend.as_ref())?;

        let mut stored_new_head = split_point;
        if self.backend.should_verify_transactions() {
            // Disconnect each transaction in the part of the chain we
            // are leaving. A pruned block here means the store threw
            // away data this deep a reorg needs; the operator has to
            // rescan.
            for old_block in &old_blocks {
                self.backend.disconnect_transactions(old_block)?;
            }
            // Walk in ascending chronological order.
            for cursor in new_blocks.iter().rev() {
                let prev = self
                    .backend
                    .get(&cursor.header().prev_block_hash)?
                    .ok_or(VerificationError::DisjointFork)?;
                let median = reorg::median_timestamp_of_recent(&prev, self.backend.as_ref())?;
                if cursor.header().timestamp <= median {
                    return Err(VerificationError::TimestampTooEarly.into());
                }
                let tx_out_changes = if cursor.hash() == new_chain_head.hash() {
                    // The tip is still in memory; connect it directly.
                    self.backend.connect_transactions(new_chain_head.height(), block)?
                } else {
                    self.backend.connect_stored_block(cursor)?
                };
                stored_new_head = self.backend.add_to_block_store(
                    &stored_new_head,
                    &Block::from_header(*cursor.header()),
                    Some(&tx_out_changes),
                )?;
            }
        } else {
            // (Finally) write the new head to the block store.
            stored_new_head = self.backend.add_to_block_store(
                &stored_prev,
                &Block::from_header(*new_chain_head.header()),
                None,
            )?;
        }

        // Inform the listeners so the set of currently spendable
        // transactions can be updated; earlier spends may have been
        // undone and new coins may have appeared.
        let registrations = self.listeners.read().unwrap().clone();
        for registration in &registrations {
            match &registration.executor {
                ListenerExecutor::Inline => {
                    registration.listener.reorganize(&split_point, &old_blocks, &new_blocks);
                }
                ListenerExecutor::Spawn(handle) => {
                    let listener = registration.listener.clone();
                    let old_blocks = old_blocks.clone();
                    let new_blocks = new_blocks.clone();
                    handle.spawn(async move {
                        listener.reorganize(&split_point, &old_blocks, &new_blocks);
                    });
                }
            }
        }

        // Update the pointer to the best known block.
        self.set_chain_head(state, stored_new_head)
    }

    /// For each block in the orphan pool, see if it now fits on top of
    /// the tree, and if so connect it. Repeats until a full pass
    /// connects nothing.
    fn try_connecting_orphans(&self, state: &mut ChainState) -> Result<(), ChainError> {
        // Brute force, but fine for the small numbers of orphans a
        // well-behaved sync produces.
        loop {
            let mut blocks_connected_this_round = 0;
            for hash in state.orphans.ordered_hashes() {
                let Some(prev_hash) = state.orphans.parent_of(&hash) else { continue };
                debug!("trying to connect {}", hash);
                if self.backend.block_in_scope(&prev_hash)?.is_none() {
                    // Still an orphan.
                    debug!("  but it is not connectable right now");
                    continue;
                }
                let Some(orphan) = state.orphans.get(&hash).cloned() else { continue };
                // `try_connecting` is false here so we don't recurse
                // into draining while draining.
                self.add_inner(state, orphan.block, false, orphan.filtered)?;
                state.orphans.remove(&hash);
                blocks_connected_this_round += 1;
            }
            if blocks_connected_this_round > 0 {
                info!("connected {} orphan blocks", blocks_connected_this_round);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn set_chain_head(&self, state: &mut ChainState, new_head: StoredBlock) -> Result<(), ChainError> {
        self.backend.do_set_chain_head(&new_head)?;
        *self.chain_head.write().unwrap() = new_head;

        // Settle anyone waiting on a height we just reached.
        let reached = new_head.height();
        let mut still_waiting = Vec::new();
        for (height, sender) in state.height_waiters.drain(..) {
            if reached >= height {
                let _ = sender.send(new_head);
            } else {
                still_waiting.push((height, sender));
            }
        }
        state.height_waiters = still_waiting;
        Ok(())
    }

    /// True if any inline listener considers any transaction in the
    /// block relevant.
    fn contains_relevant_transactions(&self, block: &Block) -> bool {
        let registrations = self.listeners.read().unwrap().clone();
        for tx in block.transactions.iter().flatten() {
            for registration in &registrations {
                if !registration.executor.is_inline() {
                    continue;
                }
                match registration.listener.is_transaction_relevant(tx) {
                    Ok(true) => return true,
                    Ok(false) => {}
                    // A script we don't understand must never break the
                    // chain; note it and move on.
                    Err(err) => warn!("failed to parse a script: {}", err),
                }
            }
        }
        false
    }

    fn inform_listeners_for_new_block(
        &self,
        state: &mut ChainState,
        block: &Block,
        block_type: NewBlockType,
        filtered: Option<&FilteredData>,
        new_stored_block: &StoredBlock,
    ) {
        // Candidate false positives: everything the filter sent us that
        // no inline listener ends up claiming.
        let mut false_positives: HashSet<Hash> =
            filtered.map(|data| data.transactions.keys().copied().collect()).unwrap_or_default();

        let registrations = self.listeners.read().unwrap().clone();
        for registration in &registrations {
            match &registration.executor {
                ListenerExecutor::Inline => {
                    inform_listener_for_new_transactions(
                        block,
                        block_type,
                        filtered,
                        new_stored_block,
                        registration.listener.as_ref(),
                        Some(&mut false_positives),
                    );
                    if block_type == NewBlockType::BestChain {
                        registration.listener.notify_new_best_block(new_stored_block);
                    }
                }
                ListenerExecutor::Spawn(handle) => {
                    // Marshal the data across; false-positive handling
                    // is impossible off-thread, so that set is dropped.
                    let listener = registration.listener.clone();
                    let block = block.clone();
                    let filtered = filtered.cloned();
                    let stored = *new_stored_block;
                    handle.spawn(async move {
                        inform_listener_for_new_transactions(
                            &block,
                            block_type,
                            filtered.as_ref(),
                            &stored,
                            listener.as_ref(),
                            None,
                        );
                        if block_type == NewBlockType::BestChain {
                            listener.notify_new_best_block(&stored);
                        }
                    });
                }
            }
        }

        state.fp.track_false_positives(false_positives.len());
    }

    /// Block at the head of the best chain: the one representing the
    /// most cumulative work.
    pub fn chain_head(&self) -> StoredBlock {
        *self.chain_head.read().unwrap()
    }

    /// Convenience for `chain_head().height()`.
    pub fn best_chain_height(&self) -> u64 {
        self.chain_head.read().unwrap().height()
    }

    /// Walks the orphan pool towards ancestors and returns the topmost
    /// orphan reachable from `hash`, or `None` if `hash` is not an
    /// orphan. Useful for asking a peer for the gap that would connect
    /// a dangling orphan chain.
    pub fn orphan_root(&self, hash: &Hash) -> Option<Block> {
        self.state.lock().unwrap().orphans.orphan_root(hash)
    }

    /// True if the block is currently buffered as an orphan.
    pub fn is_orphan(&self, hash: &Hash) -> bool {
        self.state.lock().unwrap().orphans.contains(hash)
    }

    /// Estimates when the chain will reach `height`, assuming perfect
    /// spacing. Heights in the past are extrapolated the same way
    /// rather than looked up.
    pub fn estimate_block_time(&self, height: u64) -> SystemTime {
        let head = self.chain_head();
        let offset = height as i64 - head.height() as i64;
        let estimated = head.header().timestamp as i64 + self.params.target_spacing as i64 * offset;
        UNIX_EPOCH + Duration::from_secs(estimated.max(0) as u64)
    }

    /// A receiver fulfilled exactly once, with the stored block that
    /// first reaches `height`. Resolves immediately if the chain is
    /// already there.
    pub fn height_future(&self, height: u64) -> oneshot::Receiver<StoredBlock> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let head = self.chain_head();
        if head.height() >= height {
            let _ = sender.send(head);
        } else {
            state.height_waiters.push((height, sender));
        }
        receiver
    }

    /// The estimated bloom-filter false-positive rate: the average over
    /// all filtered transactions of 1.0 for irrelevant-to-everyone and
    /// 0.0 for relevant or filtered out.
    pub fn false_positive_rate(&self) -> f64 {
        self.state.lock().unwrap().fp.rate()
    }

    /// Records a fully handled filtered block of `count` transactions
    /// for false-positive estimation. Called by the network layer once
    /// per filtered block.
    pub fn track_filtered_transactions(&self, count: usize) {
        self.state.lock().unwrap().fp.track_filtered_transactions(count);
    }

    /// Resets false-positive estimation. Used when a fresh filter is
    /// sent to the peer.
    pub fn reset_false_positive_estimate(&self) {
        self.state.lock().unwrap().fp.reset();
    }

    /// The parameters this chain was built with.
    pub fn params(&self) -> &NetworkParams {
        &self.params
    }
}

fn inform_listener_for_new_transactions(
    block: &Block,
    block_type: NewBlockType,
    filtered: Option<&FilteredData>,
    new_stored_block: &StoredBlock,
    listener: &dyn ChainListener,
    mut false_positives: Option<&mut HashSet<Hash>>,
) {
    if let Some(transactions) = &block.transactions {
        send_transactions_to_listener(
            new_stored_block,
            block_type,
            listener,
            0,
            transactions,
            false_positives.as_deref_mut(),
        );
    } else if let Some(data) = filtered {
        // Deliveries must match the order transactions appeared in the
        // block, so walk the hash list and dispatch per hash.
        for (relativity_offset, hash) in data.tx_hashes.iter().enumerate() {
            match data.transactions.get(hash) {
                Some(tx) => send_transactions_to_listener(
                    new_stored_block,
                    block_type,
                    listener,
                    relativity_offset,
                    std::slice::from_ref(tx),
                    false_positives.as_deref_mut(),
                ),
                None => listener.notify_transaction_is_in_block(
                    hash,
                    new_stored_block,
                    block_type,
                    relativity_offset,
                ),
            }
        }
    }
}

fn send_transactions_to_listener(
    block: &StoredBlock,
    block_type: NewBlockType,
    listener: &dyn ChainListener,
    mut relativity_offset: usize,
    transactions: &[Transaction],
    mut false_positives: Option<&mut HashSet<Hash>>,
) {
    for tx in transactions {
        match listener.is_transaction_relevant(tx) {
            Ok(true) => {
                if let Some(fp) = false_positives.as_deref_mut() {
                    fp.remove(&tx.txid());
                }
                // Every listener gets its own copy; two wallets sharing
                // one transaction object corrupt each other during
                // reorgs otherwise.
                listener.receive_from_block(tx.clone(), block, block_type, relativity_offset);
                relativity_offset += 1;
            }
            Ok(false) => {}
            Err(err) => {
                // Scripts we don't understand must not break the chain.
                warn!("failed to parse a script: {}", err);
            }
        }
    }
}
