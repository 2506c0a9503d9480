//! The block DAG orchestrator.
//!
//! `process_block` drives a block through sanity validation, the
//! orphan/delayed queues, GHOSTDAG coloring, past-UTXO construction and
//! commitment checking, DAG application, and a single atomic persistence
//! batch, emitting notifications once the DAG lock is released.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use dagd_consensus::constants::{
    BLOCK_VERSION, LOCK_TIME_THRESHOLD, MAX_BLOCK_SIZE, MAX_TX_IN_SEQUENCE_NUM, TX_VERSION,
};
use dagd_consensus::money::{money_range, MAX_SOMPI};
use dagd_consensus::{hash256_to_hex, Hash256};
use dagd_log::{log_debug, log_error, log_info, log_warn};
use dagd_primitives::block::Block;
use dagd_primitives::encoding::encode;
use dagd_primitives::merkle::{accepted_id_merkle_root, hash_merkle_root};
use dagd_primitives::outpoint::OutPoint;
use dagd_primitives::subnetwork::{SubnetworkId, SUBNETWORK_ID_REGISTRY};
use dagd_primitives::transaction::{
    Transaction, SEQUENCE_LOCK_TIME_DISABLED, SEQUENCE_LOCK_TIME_GRANULARITY,
    SEQUENCE_LOCK_TIME_IS_MILLISECONDS, SEQUENCE_LOCK_TIME_MASK,
};
use dagd_storage::{Column, KeyValueStore, WriteBatch};

use crate::acceptance::{
    accepted_tx_ids, BlockTxsAcceptanceData, MultiBlockTxsAcceptanceData, TxAcceptanceData,
};
use crate::blocknode::{
    status_known_invalid, BlockNode, BlockNodeStore, NodeHandle, STATUS_DATA_STORED,
    STATUS_INVALID_ANCESTOR, STATUS_VALID, STATUS_VALIDATE_FAILED,
};
use crate::blockwindow::past_median_time;
use crate::coinbase::{self, CompactFeeData};
use crate::dagio::{self, DagState};
use crate::delayed::DelayedBlocks;
use crate::difficulty::{bits_in_range, hash_meets_target, required_difficulty};
use crate::error::{DagError, RuleError};
use crate::flatfiles::FlatFileStore;
use crate::ghostdag;
use crate::interfaces::{build_relay_list, IndexManager, Mempool, ScriptVerifier, TimeSource};
use crate::multiset::{Multiset, MultisetStore};
use crate::notifications::{ConsensusNotifier, Notification};
use crate::orphans::OrphanPool;
use crate::params::Params;
use crate::reachability::ReachabilityTree;
use crate::subnetworks;
use crate::utxo::UtxoEntry;
use crate::utxodiff::{MutableUtxoDiff, UtxoDiff};
use crate::utxodiffstore::UtxoDiffStore;
use crate::utxoset::{shared_utxo_set, DiffUtxoSet, FullUtxoSet, SharedUtxoSet};
use crate::virtualblock::{ChainUpdates, VirtualBlock};

pub type BehaviorFlags = u8;

pub const BF_NONE: BehaviorFlags = 0;
/// Skips expensive transaction-level validation for blocks known valid.
pub const BF_FAST_ADD: BehaviorFlags = 1 << 0;
pub const BF_NO_POW_CHECK: BehaviorFlags = 1 << 1;
pub const BF_WAS_UNORPHANED: BehaviorFlags = 1 << 2;
/// The block body is already in the block store (startup replay).
pub const BF_WAS_STORED: BehaviorFlags = 1 << 3;
/// The block comes out of the delayed queue.
pub const BF_AFTER_DELAY: BehaviorFlags = 1 << 4;

/// Number of blocks (estimated from timestamps) behind the network tips
/// at which the DAG stops considering itself synced.
const IS_DAG_CURRENT_MAX_DIFF: i64 = 40_000;

const FINALITY_CHANNEL_BOUND: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub is_orphan: bool,
    pub is_delayed: bool,
}

impl ProcessResult {
    fn accepted() -> Self {
        Self::default()
    }

    pub fn was_accepted(&self) -> bool {
        !self.is_orphan && !self.is_delayed
    }
}

/// Relative lock-time summary of a transaction's inputs: the earliest
/// past-median time and blue score at which it may be accepted. `-1`
/// means unconstrained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceLock {
    pub milliseconds: i64,
    pub block_blue_score: i64,
}

/// Everything a miner needs from the virtual to assemble the next block.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub parent_hashes: Vec<Hash256>,
    pub accepted_id_merkle_root: Hash256,
    pub utxo_commitment: Hash256,
    pub bits: u32,
    pub median_time: i64,
    pub blue_score: u64,
}

pub struct Config<S> {
    pub params: Params,
    pub store: Arc<S>,
    pub block_files: FlatFileStore,
    pub time_source: Arc<dyn TimeSource>,
    pub script_verifier: Option<Arc<dyn ScriptVerifier>>,
    pub index_manager: Option<Arc<dyn IndexManager>>,
    pub local_subnetwork_id: Option<SubnetworkId>,
    /// Observed between batches during startup catch-up; once a block
    /// enters the write-locked acceptance path it runs to completion.
    pub interrupt: Option<Receiver<()>>,
}

pub(crate) struct DagCore {
    pub nodes: BlockNodeStore,
    pub reachability: ReachabilityTree,
    pub utxo_diffs: UtxoDiffStore,
    pub multisets: MultisetStore,
    pub virtual_block: VirtualBlock,
    pub last_finality_point: Option<NodeHandle>,
    pub genesis: Option<NodeHandle>,
}

impl DagCore {
    fn new() -> Self {
        Self {
            nodes: BlockNodeStore::new(),
            reachability: ReachabilityTree::new(),
            utxo_diffs: UtxoDiffStore::new(),
            multisets: MultisetStore::new(),
            virtual_block: VirtualBlock::new(),
            last_finality_point: None,
            genesis: None,
        }
    }
}

enum UtxoTarget {
    Node(NodeHandle),
    Virtual,
}

pub struct BlockDag<S: KeyValueStore + 'static> {
    params: Params,
    store: Arc<S>,
    block_files: Arc<FlatFileStore>,
    time_source: Arc<dyn TimeSource>,
    script_verifier: Option<Arc<dyn ScriptVerifier>>,
    index_manager: Option<Arc<dyn IndexManager>>,
    local_subnetwork_id: Option<SubnetworkId>,
    notifier: ConsensusNotifier,
    core: Arc<RwLock<DagCore>>,
    full_utxo: SharedUtxoSet,
    orphans: RwLock<OrphanPool>,
    delayed: Mutex<DelayedBlocks>,
    finality_sender: Mutex<Option<SyncSender<Hash256>>>,
    finality_worker: Mutex<Option<JoinHandle<()>>>,
    block_count: AtomicU64,
}

impl<S: KeyValueStore + 'static> BlockDag<S> {
    pub fn new(config: Config<S>) -> Result<Self, DagError> {
        let core = Arc::new(RwLock::new(DagCore::new()));
        let full_utxo = shared_utxo_set(FullUtxoSet::new());
        let (finality_sender, finality_worker) =
            spawn_finality_worker(Arc::clone(&core), Arc::clone(&config.store));

        let dag = Self {
            params: config.params,
            store: config.store,
            block_files: Arc::new(config.block_files),
            time_source: config.time_source,
            script_verifier: config.script_verifier,
            index_manager: config.index_manager,
            local_subnetwork_id: config.local_subnetwork_id,
            notifier: ConsensusNotifier::new(),
            core,
            full_utxo,
            orphans: RwLock::new(OrphanPool::new()),
            delayed: Mutex::new(DelayedBlocks::new()),
            finality_sender: Mutex::new(Some(finality_sender)),
            finality_worker: Mutex::new(Some(finality_worker)),
            block_count: AtomicU64::new(0),
        };

        dag.init_dag_state(config.interrupt)?;
        if let Some(index_manager) = &dag.index_manager {
            index_manager.init()?;
        }

        {
            let core = dag.core.read().expect("dag lock");
            if let Some(tip) = core.virtual_block.selected_parent() {
                let node = core.nodes.node(tip);
                log_info!(
                    "DAG state (blue score {}, hash {})",
                    node.blue_score,
                    hash256_to_hex(&node.hash)
                );
            }
        }

        Ok(dag)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn notifier(&self) -> &ConsensusNotifier {
        &self.notifier
    }

    pub fn now_ms(&self) -> i64 {
        self.time_source.now_ms()
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }

    /// Stops the background finalization worker. Called automatically on
    /// drop.
    pub fn shutdown(&self) {
        let sender = self.finality_sender.lock().expect("finality lock").take();
        drop(sender);
        if let Some(worker) = self.finality_worker.lock().expect("finality lock").take() {
            let _ = worker.join();
        }
    }

    // ------------------------------------------------------------------
    // Block processing
    // ------------------------------------------------------------------

    /// The main entry point for handling new blocks.
    pub fn process_block(
        &self,
        block: &Block,
        flags: BehaviorFlags,
    ) -> Result<ProcessResult, DagError> {
        let result = self.process_block_inner(block, flags)?;
        if result.was_accepted() {
            self.process_orphans(block.hash(), flags)?;
        }
        self.process_delayed_blocks(flags)?;
        Ok(result)
    }

    fn process_block_inner(
        &self,
        block: &Block,
        flags: BehaviorFlags,
    ) -> Result<ProcessResult, DagError> {
        let hash = block.hash();
        log_debug!("processing block {}", hash256_to_hex(&hash));

        {
            let core = self.core.read().expect("dag lock");
            if core.nodes.lookup(&hash).is_some() {
                return Err(RuleError::DuplicateBlock(hash).into());
            }
        }
        if self.orphans.read().expect("orphan lock").is_known(&hash)
            || self.delayed.lock().expect("delayed lock").is_known(&hash)
        {
            return Err(RuleError::DuplicateBlock(hash).into());
        }

        check_block_sanity(block, &self.params, flags)?;

        if flags & BF_AFTER_DELAY == 0 {
            let now = self.now_ms();
            let max_timestamp = now + self.params.max_allowed_timestamp_offset();
            if block.header.timestamp > max_timestamp {
                let process_time =
                    block.header.timestamp - self.params.max_allowed_timestamp_offset();
                log_debug!(
                    "block {} has a timestamp too far in the future; delaying until {}",
                    hash256_to_hex(&hash),
                    process_time
                );
                self.delayed
                    .lock()
                    .expect("delayed lock")
                    .add(block.clone(), process_time);
                return Ok(ProcessResult {
                    is_orphan: false,
                    is_delayed: true,
                });
            }

            let delayed_parent_time = {
                let delayed = self.delayed.lock().expect("delayed lock");
                block
                    .header
                    .parent_hashes
                    .iter()
                    .filter_map(|parent| delayed.process_time(parent))
                    .max()
            };
            if let Some(parent_time) = delayed_parent_time {
                let process_time = parent_time + self.params.target_time_per_block;
                self.delayed
                    .lock()
                    .expect("delayed lock")
                    .add(block.clone(), process_time);
                return Ok(ProcessResult {
                    is_orphan: false,
                    is_delayed: true,
                });
            }
        }

        let missing_parent = {
            let core = self.core.read().expect("dag lock");
            block
                .header
                .parent_hashes
                .iter()
                .find(|parent| core.nodes.lookup(parent).is_none())
                .copied()
        };
        if let Some(missing) = missing_parent {
            log_info!(
                "adding orphan block {} with missing parent {}",
                hash256_to_hex(&hash),
                hash256_to_hex(&missing)
            );
            self.orphans
                .write()
                .expect("orphan lock")
                .add(block.clone(), self.now_ms());
            return Ok(ProcessResult {
                is_orphan: true,
                is_delayed: false,
            });
        }

        let chain_updates = {
            let mut core = self.core.write().expect("dag lock");
            match self.maybe_accept_block(&mut core, block, flags) {
                Ok(updates) => updates,
                Err(err) => {
                    drop(core);
                    if matches!(err, DagError::Rule(RuleError::FinalityViolation)) {
                        self.notifier.notify(&Notification::FinalityConflict {
                            violating_block_hash: hash,
                        });
                    }
                    return Err(err);
                }
            }
        };

        self.block_count.fetch_add(1, Ordering::Relaxed);

        // Listeners run with the DAG lock released so they can query the
        // DAG without deadlocking.
        self.notifier.notify(&Notification::BlockAdded {
            block: Arc::new(block.clone()),
            was_unorphaned: flags & BF_WAS_UNORPHANED != 0,
        });
        if !chain_updates.added_chain_block_hashes.is_empty() {
            self.notifier.notify(&Notification::ChainChanged {
                removed_chain_block_hashes: chain_updates.removed_chain_block_hashes,
                added_chain_block_hashes: chain_updates.added_chain_block_hashes,
            });
        }

        log_debug!("accepted block {}", hash256_to_hex(&hash));
        Ok(ProcessResult::accepted())
    }

    /// Replays orphans whose last missing parent just got accepted,
    /// under the behavior flags of the triggering call.
    fn process_orphans(&self, accepted_hash: Hash256, flags: BehaviorFlags) -> Result<(), DagError> {
        let mut queue = VecDeque::from([accepted_hash]);
        while let Some(parent_hash) = queue.pop_front() {
            let children = self
                .orphans
                .write()
                .expect("orphan lock")
                .take_children(&parent_hash);
            for child in children {
                let child_hash = child.hash();
                match self.process_block_inner(&child, flags | BF_WAS_UNORPHANED) {
                    Ok(result) if result.was_accepted() => queue.push_back(child_hash),
                    Ok(_) => {}
                    Err(err) if err.is_rule_error() => {
                        log_warn!(
                            "unorphaned block {} was rejected: {err}",
                            hash256_to_hex(&child_hash)
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Drains delayed blocks whose process time has arrived. Rule errors
    /// are downgraded to warnings; anything else propagates.
    fn process_delayed_blocks(&self, flags: BehaviorFlags) -> Result<(), DagError> {
        loop {
            let now = self.now_ms();
            let block = self.delayed.lock().expect("delayed lock").next_ready(now);
            let Some(block) = block else {
                return Ok(());
            };
            let hash = block.hash();
            match self.process_block_inner(&block, flags | BF_AFTER_DELAY) {
                Ok(result) if result.was_accepted() => self.process_orphans(hash, flags)?,
                Ok(_) => {}
                Err(err) if err.is_rule_error() => {
                    log_warn!(
                        "delayed block {} was rejected: {err}",
                        hash256_to_hex(&hash)
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Accepts a block whose parents are all known. MUST be called with
    /// the DAG lock held for writes.
    fn maybe_accept_block(
        &self,
        core: &mut DagCore,
        block: &Block,
        flags: BehaviorFlags,
    ) -> Result<ChainUpdates, DagError> {
        let hash = block.hash();
        let fast_add = flags & BF_FAST_ADD != 0;

        let mut parents = Vec::with_capacity(block.header.parent_hashes.len());
        for parent_hash in &block.header.parent_hashes {
            let Some(parent) = core.nodes.lookup(parent_hash) else {
                return Err(RuleError::ParentBlockUnknown(*parent_hash).into());
            };
            if status_known_invalid(core.nodes.node_status(parent)) {
                self.add_node_with_invalid_ancestor(core, block)?;
                return Err(RuleError::InvalidAncestorBlock(*parent_hash).into());
            }
            parents.push(parent);
        }

        self.check_block_context(core, block, &parents, flags)?;

        let (ghostdag_data, selected_parent_anticone) =
            ghostdag::run(&core.nodes, &core.reachability, &parents, self.params.k)?;
        let node = BlockNode::new(
            hash,
            block.header.clone(),
            parents,
            ghostdag_data.selected_parent,
            ghostdag_data.blues.clone(),
            ghostdag_data.blues_anticone_sizes.clone(),
            ghostdag_data.blue_score,
            STATUS_DATA_STORED,
        );
        let handle = core.nodes.insert(node);

        // The block body and index row are stored even if connection
        // later fails: it already carries valid proof-of-work, and
        // decoupling download from the expensive connect step means the
        // body never has to be fetched again.
        {
            let mut batch = WriteBatch::new();
            if !dagio::has_block(self.store.as_ref(), &hash)? {
                dagio::store_block(&self.block_files, &mut batch, block)?;
            }
            core.nodes.flush_to_batch(&mut batch);
            self.store.write_batch(&batch)?;
            core.nodes.clear_dirty();
        }

        if !fast_add {
            let median_time = match ghostdag_data.selected_parent {
                Some(selected_parent) => {
                    past_median_time(&core.nodes, selected_parent, &self.params)
                }
                None => block.header.timestamp,
            };
            for tx in &block.transactions {
                if !is_finalized_transaction(tx, ghostdag_data.blue_score, median_time) {
                    return Err(RuleError::UnfinalizedTx(tx.id()).into());
                }
            }
        }

        match self.connect_block(core, handle, block, &selected_parent_anticone, fast_add) {
            Ok(updates) => Ok(updates),
            Err(err) => {
                if err.is_rule_error() {
                    core.nodes.add_status_flags(handle, STATUS_VALIDATE_FAILED);
                    let mut batch = WriteBatch::new();
                    core.nodes.flush_to_batch(&mut batch);
                    self.store.write_batch(&batch)?;
                    core.nodes.clear_dirty();
                }
                Err(err)
            }
        }
    }

    fn add_node_with_invalid_ancestor(
        &self,
        core: &mut DagCore,
        block: &Block,
    ) -> Result<(), DagError> {
        let node = BlockNode::new(
            block.hash(),
            block.header.clone(),
            Vec::new(),
            None,
            Vec::new(),
            Default::default(),
            0,
            STATUS_INVALID_ANCESTOR,
        );
        core.nodes.insert(node);
        let mut batch = WriteBatch::new();
        core.nodes.flush_to_batch(&mut batch);
        self.store.write_batch(&batch)?;
        core.nodes.clear_dirty();
        Ok(())
    }

    /// Validation that depends on the block's position in the DAG.
    fn check_block_context(
        &self,
        core: &DagCore,
        block: &Block,
        parents: &[NodeHandle],
        flags: BehaviorFlags,
    ) -> Result<(), DagError> {
        if parents.is_empty() {
            return Ok(());
        }
        let selected_parent = core.nodes.bluest(parents).expect("parents are non-empty");

        if flags & BF_FAST_ADD == 0 {
            let expected = required_difficulty(&core.nodes, selected_parent, &self.params)
                .map_err(|_| RuleError::InvalidBlock("invalid difficulty bits in window"))?;
            if block.header.bits != expected {
                return Err(RuleError::WrongDifficulty {
                    expected,
                    actual: block.header.bits,
                }
                .into());
            }
        }

        let median_time = past_median_time(&core.nodes, selected_parent, &self.params);
        if block.header.timestamp <= median_time {
            return Err(RuleError::TimeTooOld.into());
        }
        Ok(())
    }

    /// Connects a colored block: finality and gas checks, UTXO build and
    /// commitment verification, DAG application, and the persistence
    /// batch.
    fn connect_block(
        &self,
        core: &mut DagCore,
        handle: NodeHandle,
        block: &Block,
        selected_parent_anticone: &[NodeHandle],
        fast_add: bool,
    ) -> Result<ChainUpdates, DagError> {
        self.check_finality_violation(core, handle)?;
        subnetworks::validate_gas_limit(self.store.as_ref(), &block.transactions)?;

        let (new_block_past_utxo, acceptance_data, multiset, fee_data) =
            self.verify_and_build_utxo(core, handle, block, fast_add)?;

        coinbase::validate_coinbase_transaction(
            self.store.as_ref(),
            block,
            &acceptance_data,
            &self.params,
            core.nodes.node(handle).blue_score,
        )?;

        // All validation has passed; a failure while mutating the DAG
        // leaves the in-memory structures inconsistent and is not
        // recoverable.
        let (virtual_diff, chain_updates) = self
            .apply_dag_changes(core, handle, new_block_past_utxo, multiset, selected_parent_anticone)
            .map_err(|err| match err {
                DagError::Corruption(message) => DagError::Corruption(message),
                other => DagError::Corruption(format!("applying DAG changes: {other}")),
            })?;

        self.save_changes_from_block(
            core,
            block,
            &virtual_diff,
            &acceptance_data,
            &fee_data,
        )?;

        Ok(chain_updates)
    }

    fn verify_and_build_utxo(
        &self,
        core: &DagCore,
        handle: NodeHandle,
        block: &Block,
        fast_add: bool,
    ) -> Result<(DiffUtxoSet, MultiBlockTxsAcceptanceData, Multiset, CompactFeeData), DagError>
    {
        let (past_utxo, acceptance_data, multiset) =
            self.past_utxo(core, UtxoTarget::Node(handle), true)?;

        if !core.nodes.node(handle).is_genesis() {
            let calculated = accepted_id_merkle_root(accepted_tx_ids(&acceptance_data));
            if calculated != block.header.accepted_id_merkle_root {
                return Err(RuleError::BadAcceptedIdMerkleRoot.into());
            }
        }

        let fee_data =
            self.check_connect_to_past_utxo(core, handle, &past_utxo, &block.transactions, fast_add)?;

        let calculated_commitment = multiset.finalize_hash();
        if calculated_commitment != block.header.utxo_commitment {
            return Err(RuleError::BadUtxoCommitment.into());
        }

        Ok((past_utxo, acceptance_data, multiset, fee_data))
    }

    /// Builds the past-UTXO of `target` by restoring the selected
    /// parent's past and applying the blue blocks' transactions in
    /// order, recording per-transaction acceptance. With `with_multiset`
    /// the accepted mutations also accumulate into a multiset seeded
    /// from the selected parent's stored one.
    fn past_utxo(
        &self,
        core: &DagCore,
        target: UtxoTarget,
        with_multiset: bool,
    ) -> Result<(DiffUtxoSet, MultiBlockTxsAcceptanceData, Multiset), DagError> {
        let (selected_parent, blues, blue_score, is_genesis) = match target {
            UtxoTarget::Node(handle) => {
                let node = core.nodes.node(handle);
                (
                    node.selected_parent,
                    node.blues.clone(),
                    node.blue_score,
                    node.is_genesis(),
                )
            }
            UtxoTarget::Virtual => {
                let data = core.virtual_block.data();
                (
                    data.selected_parent,
                    data.blues.clone(),
                    data.blue_score,
                    data.selected_parent.is_none(),
                )
            }
        };

        if is_genesis {
            // The genesis has no past: a diff removing every entry of
            // the base full set yields the empty set even mid-replay.
            let mut diff = MutableUtxoDiff::new();
            {
                let base = self.full_utxo.read().expect("utxo lock");
                for (outpoint, entry) in base.collection.iter() {
                    diff.remove_entry(*outpoint, entry.clone())
                        .map_err(|err| DagError::corruption(err.to_string()))?;
                }
            }
            return Ok((
                DiffUtxoSet::new(Arc::clone(&self.full_utxo), diff),
                Vec::new(),
                Multiset::new(),
            ));
        }

        let selected_parent =
            selected_parent.ok_or_else(|| DagError::corruption("non-genesis without selected parent"))?;
        let selected_parent_past =
            restore_past_utxo(&core.utxo_diffs, &self.full_utxo, selected_parent)?;

        let mut multiset = if with_multiset {
            core.multisets.multiset_of(selected_parent)?.clone()
        } else {
            Multiset::new()
        };

        let mut past_utxo = selected_parent_past.clone();
        let mut acceptance_data = Vec::with_capacity(blues.len());
        for (i, &blue) in blues.iter().enumerate() {
            let blue_hash = core.nodes.node(blue).hash;
            let blue_block =
                dagio::fetch_block(self.store.as_ref(), &self.block_files, &blue_hash)?;
            let is_selected_parent = i == 0;

            let mut tx_acceptance_data = Vec::with_capacity(blue_block.transactions.len());
            for tx in &blue_block.transactions {
                // Coinbases outside the selected parent chain are never
                // accepted; their rewards simply do not exist in this
                // world view.
                let is_accepted = if !is_selected_parent && tx.is_coinbase() {
                    false
                } else {
                    past_utxo.add_tx(
                        tx,
                        blue_score,
                        with_multiset.then_some(&mut multiset),
                    )?
                };
                tx_acceptance_data.push(TxAcceptanceData {
                    tx_id: tx.id(),
                    is_accepted,
                });
            }
            acceptance_data.push(BlockTxsAcceptanceData {
                block_hash: blue_hash,
                tx_acceptance_data,
            });
        }

        Ok((past_utxo, acceptance_data, multiset))
    }

    /// Validates the block's own transactions against its past-UTXO and
    /// computes their fees. Nothing is applied; the block's transactions
    /// belong to its descendants' pasts.
    fn check_connect_to_past_utxo(
        &self,
        core: &DagCore,
        handle: NodeHandle,
        past_utxo: &DiffUtxoSet,
        transactions: &[Transaction],
        fast_add: bool,
    ) -> Result<CompactFeeData, DagError> {
        let node_blue_score = core.nodes.node(handle).blue_score;
        let node_median_time = past_median_time(&core.nodes, handle, &self.params);

        let mut fees = Vec::with_capacity(transactions.len());
        for tx in transactions {
            if tx.is_coinbase() {
                fees.push(0);
                continue;
            }

            let mut total_in: u64 = 0;
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let entry = past_utxo
                    .get(&input.previous_outpoint)
                    .ok_or(RuleError::MissingTxOutput(input.previous_outpoint))?;
                if entry.is_coinbase
                    && node_blue_score.saturating_sub(entry.block_blue_score)
                        < self.params.coinbase_maturity
                {
                    return Err(RuleError::ImmatureSpend(input.previous_outpoint).into());
                }
                total_in = total_in
                    .checked_add(entry.amount)
                    .filter(|&total| total <= MAX_SOMPI)
                    .ok_or(RuleError::InvalidTransaction(
                        "total input value out of range",
                    ))?;

                if !fast_add {
                    if let Some(verifier) = &self.script_verifier {
                        verifier
                            .verify_input(tx, input_index, &entry)
                            .map_err(RuleError::InvalidTransaction)?;
                    }
                }
            }

            let mut total_out: u64 = 0;
            for output in &tx.outputs {
                total_out = total_out
                    .checked_add(output.value)
                    .filter(|&total| total <= MAX_SOMPI)
                    .ok_or(RuleError::InvalidTransaction(
                        "total output value out of range",
                    ))?;
            }
            if total_out > total_in {
                return Err(
                    RuleError::InvalidTransaction("transaction spends more than its inputs").into(),
                );
            }

            if !fast_add {
                let lock = calc_sequence_lock(core, handle, past_utxo, tx, &self.params);
                let lock = lock?;
                if !sequence_lock_active(&lock, node_blue_score, node_median_time) {
                    return Err(RuleError::SequenceLockNotMet(tx.id()).into());
                }
            }

            fees.push(total_in - total_out);
        }
        Ok(CompactFeeData(fees))
    }

    /// Applies an already validated block to the DAG structures: the
    /// reachability tree, the diff-child graph, the virtual's tips and
    /// chain, and the base full UTXO set (the meld step). Errors here
    /// are unrecoverable corruption.
    fn apply_dag_changes(
        &self,
        core: &mut DagCore,
        handle: NodeHandle,
        new_block_past_utxo: DiffUtxoSet,
        multiset: Multiset,
        selected_parent_anticone: &[NodeHandle],
    ) -> Result<(UtxoDiff, ChainUpdates), DagError> {
        let selected_parent = core.nodes.node(handle).selected_parent;
        core.reachability
            .add_block(handle, selected_parent, selected_parent_anticone)?;

        core.multisets.set_multiset(handle, multiset);

        // Link children and hand each diff-child-less parent a diff
        // against the new block.
        core.nodes.update_parents_children(handle);
        core.utxo_diffs
            .set_block_diff(handle, new_block_past_utxo.diff().clone());
        let parents = core.nodes.node(handle).parents.clone();
        for parent in parents {
            if core.utxo_diffs.diff_child_by_node(parent).is_none() {
                let parent_past =
                    restore_past_utxo(&core.utxo_diffs, &self.full_utxo, parent)?;
                core.utxo_diffs.set_block_diff_child(parent, handle)?;
                let diff = new_block_past_utxo.diff_from(&parent_past)?;
                core.utxo_diffs.set_block_diff(parent, diff);
            }
        }

        let chain_updates = {
            let DagCore {
                ref nodes,
                ref reachability,
                ref mut virtual_block,
                ..
            } = *core;
            virtual_block.add_tip(nodes, reachability, self.params.k, handle)?
        };

        // Rebuild the virtual's UTXO set and refresh every tip's diff
        // against it.
        let (new_virtual_utxo, _, _) = self.past_utxo(core, UtxoTarget::Virtual, false)?;
        let tips = core.virtual_block.tips().to_vec();
        for tip in tips {
            let tip_past = restore_past_utxo(&core.utxo_diffs, &self.full_utxo, tip)?;
            let diff = new_virtual_utxo.diff_from(&tip_past)?;
            core.utxo_diffs.set_block_diff(tip, diff);
        }

        // Only now is it safe to fold the virtual's diff into the base.
        let virtual_diff = new_virtual_utxo.meld_to_base()?;

        core.nodes.add_status_flags(handle, STATUS_VALID);
        self.update_finality_point(core);

        Ok((virtual_diff, chain_updates))
    }

    /// Flushes every dirty store in one atomic batch. Dirty sets are
    /// cleared only after the batch commits.
    fn save_changes_from_block(
        &self,
        core: &mut DagCore,
        block: &Block,
        virtual_diff: &UtxoDiff,
        acceptance_data: &MultiBlockTxsAcceptanceData,
        fee_data: &CompactFeeData,
    ) -> Result<(), DagError> {
        let block_hash = block.hash();
        let mut batch = WriteBatch::new();

        core.nodes.flush_to_batch(&mut batch);
        core.utxo_diffs.flush_to_batch(&core.nodes, &mut batch);
        core.reachability.store_state(&core.nodes, &mut batch);
        core.multisets.flush_to_batch(&core.nodes, &mut batch);

        let last_finality_point = core
            .last_finality_point
            .ok_or_else(|| DagError::corruption("missing finality point after connect"))?;
        let state = DagState {
            tip_hashes: core
                .virtual_block
                .tips()
                .iter()
                .map(|&tip| core.nodes.node(tip).hash)
                .collect(),
            last_finality_point: core.nodes.node(last_finality_point).hash,
            local_subnetwork_id: self.local_subnetwork_id,
        };
        dagio::save_dag_state(&mut batch, &state);

        // Mirror the meld into the persisted flat UTXO set.
        for (outpoint, _) in virtual_diff.to_remove.iter() {
            batch.delete(Column::UtxoSet, outpoint.key_bytes());
        }
        for (outpoint, entry) in virtual_diff.to_add.iter() {
            batch.put(Column::UtxoSet, outpoint.key_bytes(), entry.encode());
        }

        subnetworks::register_subnetworks(&mut batch, &block.transactions)?;

        if let Some(index_manager) = &self.index_manager {
            index_manager.connect_block(&mut batch, &block_hash, acceptance_data)?;
        }

        coinbase::put_fee_data(&mut batch, &block_hash, fee_data);

        self.store.write_batch(&batch)?;

        core.nodes.clear_dirty();
        core.utxo_diffs.clear_dirty();
        core.utxo_diffs.clear_old_entries(&core.nodes);
        core.reachability.clear_dirty();
        core.multisets.clear_new_entries();
        Ok(())
    }

    /// A new block must not fork away below the last finality point.
    fn check_finality_violation(&self, core: &DagCore, handle: NodeHandle) -> Result<(), DagError> {
        let node = core.nodes.node(handle);
        if node.is_genesis() {
            return Ok(());
        }
        let Some(last_finality_point) = core.last_finality_point else {
            return Ok(());
        };
        let selected_parent = node.selected_parent.expect("non-genesis");
        if last_finality_point == selected_parent {
            return Ok(());
        }
        if !core
            .reachability
            .is_chain_ancestor_of(last_finality_point, selected_parent)?
        {
            return Err(RuleError::FinalityViolation.into());
        }
        Ok(())
    }

    /// Advances the finality point when the selected tip's finality
    /// score has moved two windows past it, and wakes the background
    /// finalization worker.
    fn update_finality_point(&self, core: &mut DagCore) {
        let Some(selected_tip) = core.virtual_block.selected_parent() else {
            return;
        };
        if core.nodes.node(selected_tip).is_genesis() {
            core.last_finality_point = Some(selected_tip);
            return;
        }
        let Some(last_finality_point) = core.last_finality_point else {
            return;
        };
        let finality_interval = self.params.finality_interval().max(1);
        let score = |handle: NodeHandle| core.nodes.node(handle).blue_score / finality_interval;

        if score(selected_tip) < score(last_finality_point) + 2 {
            return;
        }

        // The first block of the window one past the current finality
        // point becomes the new finality point.
        let mut current = core
            .nodes
            .node(selected_tip)
            .selected_parent
            .expect("non-genesis");
        loop {
            let Some(selected_parent) = core.nodes.node(current).selected_parent else {
                break;
            };
            if score(selected_parent) == score(last_finality_point) {
                break;
            }
            current = selected_parent;
        }
        core.last_finality_point = Some(current);
        let point_hash = core.nodes.node(current).hash;
        log_debug!(
            "finality point advanced to {}",
            hash256_to_hex(&point_hash)
        );

        if let Some(sender) = &*self.finality_sender.lock().expect("finality lock") {
            if let Err(TrySendError::Full(_)) = sender.try_send(point_hash) {
                // The worker is idempotent; a skipped event is repaired
                // by the next advance or the startup pass.
                log_warn!("finalization worker backlog; skipping event");
            }
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    fn init_dag_state(&self, interrupt: Option<Receiver<()>>) -> Result<(), DagError> {
        match dagio::load_dag_state(self.store.as_ref())? {
            None => {
                log_info!("no DAG state found; bootstrapping from genesis");
                let genesis = self.params.genesis.clone();
                let result = self.process_block(&genesis, BF_NO_POW_CHECK)?;
                if !result.was_accepted() {
                    return Err(DagError::corruption(
                        "genesis block was not accepted at bootstrap",
                    ));
                }
                let mut core = self.core.write().expect("dag lock");
                core.genesis = core.nodes.lookup(&self.params.genesis_hash());
                Ok(())
            }
            Some(state) => self.load_dag_state(state, interrupt),
        }
    }

    fn load_dag_state(
        &self,
        state: DagState,
        interrupt: Option<Receiver<()>>,
    ) -> Result<(), DagError> {
        if state.local_subnetwork_id != self.local_subnetwork_id {
            return Err(DagError::corruption(
                "database was built with a different local subnetwork ID; reset the database to switch",
            ));
        }

        let unprocessed = {
            let mut core = self.core.write().expect("dag lock");

            log_debug!("loading block index...");
            let unprocessed = self.load_block_index(&mut core, &interrupt)?;

            log_debug!("loading reachability data...");
            self.load_reachability(&mut core)?;

            log_debug!("loading multiset data...");
            self.load_multisets(&mut core)?;

            log_debug!("loading UTXO diffs...");
            self.load_utxo_diffs(&mut core)?;

            log_debug!("loading UTXO set...");
            self.load_full_utxo_set()?;

            log_debug!("applying the stored tips to the virtual block...");
            let mut tips = Vec::with_capacity(state.tip_hashes.len());
            for tip_hash in &state.tip_hashes {
                let tip = core.nodes.lookup(tip_hash).ok_or_else(|| {
                    DagError::corruption("cannot find a stored DAG tip in the block index")
                })?;
                tips.push(tip);
            }
            {
                let DagCore {
                    ref nodes,
                    ref reachability,
                    ref mut virtual_block,
                    ..
                } = *core;
                virtual_block.set_tips(nodes, reachability, self.params.k, tips)?;
            }

            core.genesis = Some(core.nodes.lookup(&self.params.genesis_hash()).ok_or_else(
                || DagError::corruption("genesis block is missing from the block index"),
            )?);
            core.last_finality_point = Some(
                core.nodes
                    .lookup(&state.last_finality_point)
                    .ok_or_else(|| {
                        DagError::corruption("finality point block does not exist in the DAG")
                    })?,
            );

            core.nodes.clear_dirty();
            unprocessed
        };

        // Re-run the finalization pass; diff blobs were already deleted
        // before the previous shutdown, so this only restores the
        // in-memory finalized flags.
        finalize_nodes_below_finality_point(
            &self.core,
            self.store.as_ref(),
            &state.last_finality_point,
            false,
        );

        log_debug!("processing unprocessed block nodes...");
        for hash in unprocessed {
            if let Some(rx) = &interrupt {
                if rx.try_recv().is_ok() {
                    return Err(DagError::Interrupted);
                }
            }
            if !dagio::has_block(self.store.as_ref(), &hash)? {
                return Err(DagError::corruption(
                    "block exists in the block index but not in the block store",
                ));
            }
            let block = dagio::fetch_block(self.store.as_ref(), &self.block_files, &hash)?;
            match self.process_block(&block, BF_WAS_STORED) {
                Ok(result) if result.was_accepted() => {}
                Ok(_) => {
                    return Err(DagError::corruption(
                        "a stored block turned out to be an orphan or delayed",
                    ))
                }
                Err(err) if err.is_rule_error() => {
                    log_warn!(
                        "stored block {} failed to be accepted to the DAG: {err}",
                        hash256_to_hex(&hash)
                    );
                }
                Err(err) => return Err(err),
            }
        }

        log_info!("DAG state initialized");
        Ok(())
    }

    /// Loads the block index in blue-score order, resolving parent
    /// references. Rows whose parents sort after them (equal blue
    /// scores) are retried until the index stabilizes. Rows that are
    /// only `data-stored` are returned for replay instead of inserted.
    fn load_block_index(
        &self,
        core: &mut DagCore,
        interrupt: &Option<Receiver<()>>,
    ) -> Result<Vec<Hash256>, DagError> {
        let rows = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut queue: VecDeque<crate::blocknode::RawBlockNode> = VecDeque::new();
        for (_, value) in rows {
            queue.push_back(
                crate::blocknode::deserialize_block_node(&value)
                    .map_err(|err| DagError::corruption(err.to_string()))?,
            );
        }

        let mut unprocessed = Vec::new();
        let mut progressed = true;
        while progressed && !queue.is_empty() {
            progressed = false;
            for _ in 0..queue.len() {
                if let Some(rx) = interrupt {
                    if rx.try_recv().is_ok() {
                        return Err(DagError::Interrupted);
                    }
                }
                let raw = queue.pop_front().expect("checked non-empty");

                if raw.status == STATUS_DATA_STORED {
                    unprocessed.push(raw.hash);
                    progressed = true;
                    continue;
                }

                if status_known_invalid(raw.status) {
                    // Invalid nodes are kept for duplicate detection
                    // only; their ancestry is irrelevant.
                    core.nodes.insert(BlockNode::new(
                        raw.hash,
                        raw.header,
                        Vec::new(),
                        None,
                        Vec::new(),
                        Default::default(),
                        raw.blue_score,
                        raw.status,
                    ));
                    progressed = true;
                    continue;
                }

                let parents: Option<Vec<NodeHandle>> = raw
                    .header
                    .parent_hashes
                    .iter()
                    .map(|hash| core.nodes.lookup(hash))
                    .collect();
                let Some(parents) = parents else {
                    queue.push_back(raw);
                    continue;
                };

                let selected_parent = match raw.selected_parent_hash {
                    Some(hash) => Some(core.nodes.lookup(&hash).ok_or_else(|| {
                        DagError::corruption("selected parent missing from block index")
                    })?),
                    None => None,
                };
                let blues = raw
                    .blues
                    .iter()
                    .map(|hash| {
                        core.nodes.lookup(hash).ok_or_else(|| {
                            DagError::corruption("blue block missing from block index")
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let blues_anticone_sizes = raw
                    .blues_anticone_sizes
                    .iter()
                    .map(|(hash, size)| {
                        core.nodes
                            .lookup(hash)
                            .map(|handle| (handle, *size))
                            .ok_or_else(|| {
                                DagError::corruption("blue block missing from block index")
                            })
                    })
                    .collect::<Result<_, _>>()?;

                let handle = core.nodes.insert(BlockNode::new(
                    raw.hash,
                    raw.header,
                    parents,
                    selected_parent,
                    blues,
                    blues_anticone_sizes,
                    raw.blue_score,
                    raw.status,
                ));
                core.nodes.update_parents_children(handle);
                self.block_count.fetch_add(1, Ordering::Relaxed);
                progressed = true;
            }
        }
        if !queue.is_empty() {
            return Err(DagError::corruption(
                "block index contains unresolvable parent references",
            ));
        }
        Ok(unprocessed)
    }

    fn load_reachability(&self, core: &mut DagCore) -> Result<(), DagError> {
        let rows = self.store.scan_prefix(Column::ReachabilityData, &[])?;
        for (key, value) in rows {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| DagError::corruption("invalid reachability key"))?;
            let handle = core
                .nodes
                .lookup(&hash)
                .ok_or_else(|| DagError::corruption("reachability data for unknown block"))?;
            let raw = crate::reachability::deserialize_reachability_data(&value)
                .map_err(|err| DagError::corruption(err.to_string()))?;

            let resolve = |hash: &Hash256| {
                core.nodes
                    .lookup(hash)
                    .ok_or_else(|| DagError::corruption("reachability references unknown block"))
            };
            let parent = raw.parent_hash.as_ref().map(&resolve).transpose()?;
            let children = raw
                .children
                .iter()
                .map(&resolve)
                .collect::<Result<Vec<_>, _>>()?;
            let future_covering_set = raw
                .future_covering_set
                .iter()
                .map(&resolve)
                .collect::<Result<Vec<_>, _>>()?;

            core.reachability.insert_loaded(
                handle,
                crate::reachability::ReachabilityData {
                    interval: raw.interval,
                    parent,
                    children,
                    future_covering_set,
                },
            );
        }
        Ok(())
    }

    fn load_multisets(&self, core: &mut DagCore) -> Result<(), DagError> {
        let rows = self.store.scan_prefix(Column::Multisets, &[])?;
        for (key, value) in rows {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| DagError::corruption("invalid multiset key"))?;
            let handle = core
                .nodes
                .lookup(&hash)
                .ok_or_else(|| DagError::corruption("multiset data for unknown block"))?;
            core.multisets
                .insert_loaded(handle, Multiset::deserialize(&value)?);
        }
        Ok(())
    }

    fn load_utxo_diffs(&self, core: &mut DagCore) -> Result<(), DagError> {
        let rows = self.store.scan_prefix(Column::UtxoDiffs, &[])?;
        for (key, value) in rows {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| DagError::corruption("invalid UTXO diff key"))?;
            let handle = core
                .nodes
                .lookup(&hash)
                .ok_or_else(|| DagError::corruption("UTXO diff data for unknown block"))?;
            let raw = crate::utxodiffstore::deserialize_diff_data(&value)
                .map_err(|err| DagError::corruption(err.to_string()))?;
            let diff_child = match raw.diff_child_hash {
                Some(child_hash) => Some(core.nodes.lookup(&child_hash).ok_or_else(|| {
                    DagError::corruption("UTXO diff child missing from block index")
                })?),
                None => None,
            };
            core.utxo_diffs.insert_loaded(handle, raw.diff, diff_child);
        }
        Ok(())
    }

    fn load_full_utxo_set(&self) -> Result<(), DagError> {
        let rows = self.store.scan_prefix(Column::UtxoSet, &[])?;
        let mut full = self.full_utxo.write().expect("utxo lock");
        for (key, value) in rows {
            let outpoint = OutPoint::from_key_bytes(&key)
                .ok_or_else(|| DagError::corruption("invalid UTXO set key"))?;
            let entry = UtxoEntry::decode(&value)
                .map_err(|err| DagError::corruption(err.to_string()))?;
            full.collection.add(outpoint, entry);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the hash names a block in the DAG structures (any
    /// status).
    pub fn is_in_dag(&self, hash: &Hash256) -> bool {
        self.core
            .read()
            .expect("dag lock")
            .nodes
            .lookup(hash)
            .is_some()
    }

    /// Whether the block is known anywhere: the DAG, the orphan pool, or
    /// the delayed queue.
    pub fn is_known_block(&self, hash: &Hash256) -> bool {
        self.is_in_dag(hash)
            || self.is_known_orphan(hash)
            || self.delayed.lock().expect("delayed lock").is_known(hash)
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.read().expect("orphan lock").is_known(hash)
    }

    pub fn is_known_invalid(&self, hash: &Hash256) -> bool {
        let core = self.core.read().expect("dag lock");
        match core.nodes.lookup(hash) {
            Some(handle) => status_known_invalid(core.nodes.node_status(handle)),
            None => false,
        }
    }

    /// Whether the block sits below the finality point. May lag behind
    /// while the finalization worker catches up.
    pub fn is_known_finalized(&self, hash: &Hash256) -> bool {
        let core = self.core.read().expect("dag lock");
        core.nodes
            .lookup(hash)
            .is_some_and(|handle| core.nodes.node(handle).is_finalized())
    }

    /// All parents missing from the orphan sub-DAG rooted at the given
    /// orphan.
    pub fn orphan_missing_ancestors(&self, orphan_hash: &Hash256) -> Vec<Hash256> {
        let orphans = self.orphans.read().expect("orphan lock");
        orphans.missing_ancestors(orphan_hash, |hash| self.is_in_dag(hash))
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Block, DagError> {
        if !self.is_in_dag(hash) {
            return Err(DagError::NotInDag(*hash));
        }
        dagio::fetch_block(self.store.as_ref(), &self.block_files, hash)
    }

    pub fn blue_score_by_hash(&self, hash: &Hash256) -> Result<u64, DagError> {
        let core = self.core.read().expect("dag lock");
        let handle = core.nodes.lookup(hash).ok_or(DagError::NotInDag(*hash))?;
        Ok(core.nodes.node(handle).blue_score)
    }

    pub fn blues_by_hash(&self, hash: &Hash256) -> Result<Vec<Hash256>, DagError> {
        let core = self.core.read().expect("dag lock");
        let handle = core.nodes.lookup(hash).ok_or(DagError::NotInDag(*hash))?;
        Ok(core
            .nodes
            .node(handle)
            .blues
            .iter()
            .map(|&blue| core.nodes.node(blue).hash)
            .collect())
    }

    pub fn selected_tip_hash(&self) -> Option<Hash256> {
        let core = self.core.read().expect("dag lock");
        core.virtual_block
            .selected_parent()
            .map(|tip| core.nodes.node(tip).hash)
    }

    pub fn tip_hashes(&self) -> Vec<Hash256> {
        let core = self.core.read().expect("dag lock");
        core.virtual_block
            .tips()
            .iter()
            .map(|&tip| core.nodes.node(tip).hash)
            .collect()
    }

    pub fn virtual_blue_score(&self) -> u64 {
        self.core
            .read()
            .expect("dag lock")
            .virtual_block
            .blue_score()
    }

    pub fn last_finality_point_hash(&self) -> Option<Hash256> {
        let core = self.core.read().expect("dag lock");
        core.last_finality_point
            .map(|handle| core.nodes.node(handle).hash)
    }

    pub fn is_in_selected_parent_chain(&self, hash: &Hash256) -> Result<bool, DagError> {
        let core = self.core.read().expect("dag lock");
        let handle = core.nodes.lookup(hash).ok_or(DagError::NotInDag(*hash))?;
        Ok(core.virtual_block.selected_parent_chain_contains(handle))
    }

    pub fn selected_parent_chain_hashes(&self) -> Vec<Hash256> {
        let core = self.core.read().expect("dag lock");
        core.virtual_block
            .selected_parent_chain()
            .iter()
            .map(|&handle| core.nodes.node(handle).hash)
            .collect()
    }

    /// The requested entry of the virtual's UTXO set.
    pub fn get_utxo_entry(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.full_utxo
            .read()
            .expect("utxo lock")
            .get(outpoint)
            .cloned()
    }

    /// Past median time of the current selected tip.
    pub fn calc_past_median_time(&self) -> Result<i64, DagError> {
        let core = self.core.read().expect("dag lock");
        let tip = core
            .virtual_block
            .selected_parent()
            .ok_or_else(|| DagError::corruption("the DAG has no selected tip"))?;
        Ok(past_median_time(&core.nodes, tip, &self.params))
    }

    /// The relative lock-time summary of a transaction evaluated
    /// against the virtual's UTXO set.
    pub fn calc_tx_sequence_lock(&self, tx: &Transaction) -> Result<SequenceLock, DagError> {
        let core = self.core.read().expect("dag lock");
        let tip = core
            .virtual_block
            .selected_parent()
            .ok_or_else(|| DagError::corruption("the DAG has no selected tip"))?;
        let utxo = DiffUtxoSet::new(Arc::clone(&self.full_utxo), MutableUtxoDiff::new());
        calc_sequence_lock(&core, tip, &utxo, tx, &self.params)
    }

    /// The acceptance data of the transactions in the given block's
    /// blues, recomputed from its restored past-UTXO.
    pub fn txs_acceptance_data(
        &self,
        hash: &Hash256,
    ) -> Result<MultiBlockTxsAcceptanceData, DagError> {
        let core = self.core.read().expect("dag lock");
        let handle = core.nodes.lookup(hash).ok_or(DagError::NotInDag(*hash))?;
        let (_, acceptance_data, _) = self.past_utxo(&core, UtxoTarget::Node(handle), false)?;
        Ok(acceptance_data)
    }

    /// The acceptance data of the current virtual block.
    pub fn txs_accepted_by_virtual(&self) -> Result<MultiBlockTxsAcceptanceData, DagError> {
        let core = self.core.read().expect("dag lock");
        let (_, acceptance_data, _) = self.past_utxo(&core, UtxoTarget::Virtual, false)?;
        Ok(acceptance_data)
    }

    /// Whether the DAG believes it is synced with the network, judged by
    /// the selected tip's timestamp.
    pub fn is_synced(&self) -> bool {
        let tip_timestamp = {
            let core = self.core.read().expect("dag lock");
            match core.virtual_block.selected_parent() {
                Some(tip) => core.nodes.node(tip).timestamp(),
                None => self.params.genesis.header.timestamp,
            }
        };
        self.now_ms() - tip_timestamp <= IS_DAG_CURRENT_MAX_DIFF * self.params.target_time_per_block
    }

    /// Derives the data a miner needs for the next block from the
    /// virtual's state.
    pub fn build_block_template(&self) -> Result<BlockTemplate, DagError> {
        let core = self.core.read().expect("dag lock");
        let selected_parent = core
            .virtual_block
            .selected_parent()
            .ok_or_else(|| DagError::corruption("the DAG has no selected tip"))?;
        let (_, acceptance_data, multiset) =
            self.past_utxo(&core, UtxoTarget::Virtual, true)?;
        let bits = required_difficulty(&core.nodes, selected_parent, &self.params)
            .map_err(|err| DagError::corruption(err.to_string()))?;
        Ok(BlockTemplate {
            parent_hashes: core
                .virtual_block
                .tips()
                .iter()
                .map(|&tip| core.nodes.node(tip).hash)
                .collect(),
            accepted_id_merkle_root: accepted_id_merkle_root(accepted_tx_ids(&acceptance_data)),
            utxo_commitment: multiset.finalize_hash(),
            bits,
            median_time: past_median_time(&core.nodes, selected_parent, &self.params),
            blue_score: core.virtual_block.blue_score(),
        })
    }

    /// Hands a freshly accepted block to the mempool and builds the
    /// transaction relay list: newly accepted IDs first, rebroadcast IDs
    /// appended, bounded by the inventory limit. Rebroadcast is skipped
    /// while the DAG is syncing.
    pub fn on_new_block(&self, mempool: &dyn Mempool, block: &Block) -> Vec<Hash256> {
        let accepted = mempool.handle_new_block(block);
        let rebroadcast = if self.is_synced() {
            mempool.transactions_to_rebroadcast()
        } else {
            Vec::new()
        };
        build_relay_list(accepted, rebroadcast)
    }
}

impl<S: KeyValueStore + 'static> Drop for BlockDag<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

/// Restores the past-UTXO of a block by walking its diff-child chain up
/// to the virtual and composing the diffs back down, in place.
fn restore_past_utxo(
    utxo_diffs: &UtxoDiffStore,
    base: &SharedUtxoSet,
    node: NodeHandle,
) -> Result<DiffUtxoSet, DagError> {
    let mut stack = vec![node];
    while let Some(child) = utxo_diffs.diff_child_by_node(*stack.last().expect("non-empty")) {
        stack.push(child);
    }

    let top = stack.pop().expect("non-empty");
    let mut accumulated = utxo_diffs.diff_by_node(top)?.clone_mutable();
    for &current in stack.iter().rev() {
        accumulated
            .with_diff_in_place(utxo_diffs.diff_by_node(current)?)
            .map_err(|err| DagError::corruption(err.to_string()))?;
    }

    Ok(DiffUtxoSet::new(Arc::clone(base), accumulated))
}

/// Computes the relative lock-time summary for `tx` against `utxo_set`,
/// in the context of `ctx_node`'s chain.
fn calc_sequence_lock(
    core: &DagCore,
    ctx_node: NodeHandle,
    utxo_set: &DiffUtxoSet,
    tx: &Transaction,
    params: &Params,
) -> Result<SequenceLock, DagError> {
    let mut lock = SequenceLock {
        milliseconds: -1,
        block_blue_score: -1,
    };
    if tx.is_coinbase() {
        return Ok(lock);
    }

    for input in &tx.inputs {
        let entry = utxo_set
            .get(&input.previous_outpoint)
            .ok_or(RuleError::MissingTxOutput(input.previous_outpoint))?;
        let input_blue_score = entry.block_blue_score;
        let sequence = input.sequence;

        if sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
            continue;
        }
        let relative = (sequence & SEQUENCE_LOCK_TIME_MASK) as i64;

        if sequence & SEQUENCE_LOCK_TIME_IS_MILLISECONDS != 0 {
            // Time locks count from the past median time of the block
            // that directly preceded the input's acceptance.
            let mut block_node = ctx_node;
            while let Some(selected_parent) = core.nodes.node(block_node).selected_parent {
                if core.nodes.node(selected_parent).blue_score <= input_blue_score {
                    break;
                }
                block_node = selected_parent;
            }
            let median_time = past_median_time(&core.nodes, block_node, params);
            let time_lock = median_time + ((relative << SEQUENCE_LOCK_TIME_GRANULARITY) - 1);
            if time_lock > lock.milliseconds {
                lock.milliseconds = time_lock;
            }
        } else {
            let score_lock = input_blue_score as i64 + relative - 1;
            if score_lock > lock.block_blue_score {
                lock.block_blue_score = score_lock;
            }
        }
    }

    Ok(lock)
}

fn sequence_lock_active(lock: &SequenceLock, blue_score: u64, median_time: i64) -> bool {
    lock.milliseconds < median_time && lock.block_blue_score < blue_score as i64
}

fn is_finalized_transaction(tx: &Transaction, blue_score: u64, median_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let target = if tx.lock_time < LOCK_TIME_THRESHOLD {
        blue_score
    } else {
        median_time as u64
    };
    if tx.lock_time < target {
        return true;
    }
    // A transaction with every sequence maxed is finalized regardless of
    // its lock time.
    tx.inputs
        .iter()
        .all(|input| input.sequence == MAX_TX_IN_SEQUENCE_NUM)
}

/// Stateless block validation: structure, proof-of-work, merkle root,
/// and per-transaction sanity.
fn check_block_sanity(
    block: &Block,
    params: &Params,
    flags: BehaviorFlags,
) -> Result<(), DagError> {
    let header = &block.header;

    if header.version != BLOCK_VERSION {
        return Err(RuleError::InvalidBlock("unknown block version").into());
    }
    if header.parent_hashes.len() > params.max_block_parents {
        return Err(RuleError::TooManyParents(header.parent_hashes.len()).into());
    }
    let mut seen_parents = HashSet::with_capacity(header.parent_hashes.len());
    for parent in &header.parent_hashes {
        if !seen_parents.insert(*parent) {
            return Err(RuleError::InvalidBlock("duplicate parent hash").into());
        }
    }
    if header.parent_hashes.is_empty() && block.hash() != params.genesis_hash() {
        return Err(RuleError::InvalidBlock("only the genesis block may have no parents").into());
    }
    if header.timestamp <= 0 {
        return Err(RuleError::InvalidBlock("block timestamp is not positive").into());
    }

    if flags & (BF_FAST_ADD | BF_NO_POW_CHECK | BF_WAS_STORED) == 0 {
        if !bits_in_range(header.bits, params) {
            return Err(RuleError::InvalidBlock("difficulty bits out of range").into());
        }
        let meets = hash_meets_target(&block.hash(), header.bits)
            .map_err(|_| RuleError::InvalidBlock("invalid difficulty bits"))?;
        if !meets {
            return Err(RuleError::HighHash.into());
        }
    }

    if block.transactions.is_empty() {
        return Err(RuleError::InvalidBlock("block has no transactions").into());
    }
    for (i, tx) in block.transactions.iter().enumerate() {
        if i == 0 && !tx.is_coinbase() {
            return Err(
                RuleError::InvalidBlock("first transaction in block must be a coinbase").into(),
            );
        }
        if i > 0 && tx.is_coinbase() {
            return Err(RuleError::InvalidBlock("block has multiple coinbases").into());
        }
        check_transaction_sanity(tx)?;
    }
    // Gas accounting requires grouping; the coinbase is exempt.
    for pair in block.transactions[1..].windows(2) {
        if pair[0].subnetwork_id > pair[1].subnetwork_id {
            return Err(RuleError::InvalidBlock("transactions not ordered by subnetwork").into());
        }
    }

    if encode(block).len() > MAX_BLOCK_SIZE as usize {
        return Err(RuleError::InvalidBlock("block exceeds maximum size").into());
    }

    if hash_merkle_root(&block.transactions) != header.hash_merkle_root {
        return Err(RuleError::BadMerkleRoot.into());
    }

    Ok(())
}

fn check_transaction_sanity(tx: &Transaction) -> Result<(), DagError> {
    if tx.version != TX_VERSION {
        return Err(RuleError::InvalidTransaction("unknown transaction version").into());
    }
    if tx.is_coinbase() {
        if !tx.inputs.is_empty() {
            return Err(RuleError::InvalidTransaction("coinbase must not have inputs").into());
        }
        if tx.payload.len() < 8 {
            return Err(RuleError::InvalidTransaction("coinbase payload is too short").into());
        }
    } else if tx.inputs.is_empty() {
        return Err(RuleError::InvalidTransaction("transaction has no inputs").into());
    }

    let mut seen_inputs = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen_inputs.insert(input.previous_outpoint) {
            return Err(RuleError::InvalidTransaction("duplicate transaction input").into());
        }
    }

    let mut total_out: u64 = 0;
    for output in &tx.outputs {
        if !money_range(output.value) {
            return Err(RuleError::InvalidTransaction("output value out of range").into());
        }
        total_out = total_out
            .checked_add(output.value)
            .filter(|&total| money_range(total))
            .ok_or(RuleError::InvalidTransaction("total output value out of range"))?;
    }

    if tx.payload_hash != tx.computed_payload_hash() {
        return Err(RuleError::InvalidTransaction("payload hash mismatch").into());
    }
    if (tx.subnetwork_id.is_native() || tx.subnetwork_id.is_builtin()) && tx.gas != 0 {
        return Err(
            RuleError::InvalidTransaction("gas in a native or builtin subnetwork").into(),
        );
    }
    if tx.subnetwork_id.is_native() && !tx.payload.is_empty() {
        return Err(RuleError::InvalidTransaction("payload in the native subnetwork").into());
    }
    if tx.subnetwork_id == SUBNETWORK_ID_REGISTRY && tx.payload.len() != 8 {
        return Err(
            RuleError::InvalidTransaction("malformed subnetwork registry payload").into(),
        );
    }
    Ok(())
}

fn spawn_finality_worker<S: KeyValueStore + 'static>(
    core: Arc<RwLock<DagCore>>,
    store: Arc<S>,
) -> (SyncSender<Hash256>, JoinHandle<()>) {
    let (sender, receiver) = sync_channel::<Hash256>(FINALITY_CHANNEL_BOUND);
    let worker = std::thread::Builder::new()
        .name("dagd-finality".to_string())
        .spawn(move || {
            for point_hash in receiver {
                finalize_nodes_below_finality_point(&core, store.as_ref(), &point_hash, true);
            }
        })
        .expect("spawn finality worker");
    (sender, worker)
}

/// Marks every block strictly below the finality point as finalized and
/// (optionally) deletes its persisted diff data. Runs under a read lock
/// only; re-running it is a no-op.
fn finalize_nodes_below_finality_point<S: KeyValueStore>(
    core: &RwLock<DagCore>,
    store: &S,
    point_hash: &Hash256,
    delete_diff_data: bool,
) {
    let hashes_to_delete = {
        let core = core.read().expect("dag lock");
        let Some(point) = core.nodes.lookup(point_hash) else {
            log_warn!(
                "finality point {} is unknown; skipping finalization pass",
                hash256_to_hex(point_hash)
            );
            return;
        };
        let mut queue: Vec<NodeHandle> = core.nodes.node(point).parents.clone();
        let mut to_delete = Vec::new();
        while let Some(current) = queue.pop() {
            let node = core.nodes.node(current);
            if node.is_finalized() {
                continue;
            }
            node.set_finalized();
            if delete_diff_data {
                to_delete.push(node.hash);
            }
            queue.extend(node.parents.iter().copied());
        }
        to_delete
    };

    for hash in hashes_to_delete {
        if let Err(err) = store.delete(Column::UtxoDiffs, &hash) {
            log_error!(
                "failed removing diff data of finalized block {}: {err}",
                hash256_to_hex(&hash)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::UtxoEntry;
    use dagd_consensus::ZERO_HASH;
    use dagd_primitives::block::BlockHeader;
    use dagd_primitives::subnetwork::SUBNETWORK_ID_NATIVE;
    use dagd_primitives::transaction::{TxIn, TxOut};

    fn native_tx(sequence: u64, lock_time: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_outpoint: OutPoint::new([3u8; 32], 0),
                signature_script: Vec::new(),
                sequence,
            }],
            outputs: vec![TxOut {
                value: 10,
                script_pub_key: vec![0x51],
            }],
            lock_time,
            subnetwork_id: SUBNETWORK_ID_NATIVE,
            gas: 0,
            payload_hash: ZERO_HASH,
            payload: Vec::new(),
        }
    }

    #[test]
    fn disabled_sequence_yields_unconstrained_lock() {
        let mut core = DagCore::new();
        let header = BlockHeader {
            version: 1,
            parent_hashes: Vec::new(),
            hash_merkle_root: ZERO_HASH,
            accepted_id_merkle_root: ZERO_HASH,
            utxo_commitment: ZERO_HASH,
            timestamp: 1_000,
            bits: 0,
            nonce: 0,
        };
        let ctx = core.nodes.insert(BlockNode::new(
            header.hash(),
            header,
            Vec::new(),
            None,
            Vec::new(),
            Default::default(),
            0,
            STATUS_VALID,
        ));

        let base = shared_utxo_set(FullUtxoSet::new());
        base.write().expect("lock").collection.add(
            OutPoint::new([3u8; 32], 0),
            UtxoEntry {
                amount: 100,
                script_pub_key: vec![0x51],
                block_blue_score: 0,
                is_coinbase: false,
            },
        );
        let utxo = DiffUtxoSet::new(base, MutableUtxoDiff::new());

        let params = Params::regtest();
        let tx = native_tx(SEQUENCE_LOCK_TIME_DISABLED | 50, 0);
        let lock = calc_sequence_lock(&core, ctx, &utxo, &tx, &params).expect("lock");
        assert_eq!(
            lock,
            SequenceLock {
                milliseconds: -1,
                block_blue_score: -1
            }
        );
        assert!(sequence_lock_active(&lock, 0, 0));

        // A block-based relative lock constrains the blue score.
        let tx = native_tx(5, 0);
        let lock = calc_sequence_lock(&core, ctx, &utxo, &tx, &params).expect("lock");
        assert_eq!(lock.block_blue_score, 4);
        assert!(!sequence_lock_active(&lock, 4, 1_000));
        assert!(sequence_lock_active(&lock, 5, 1_000));
    }

    #[test]
    fn transaction_finality_rules() {
        // Zero lock time is always finalized.
        assert!(is_finalized_transaction(&native_tx(0, 0), 0, 0));
        // Blue-score lock: finalized strictly below the score.
        assert!(is_finalized_transaction(&native_tx(0, 10), 11, 0));
        assert!(!is_finalized_transaction(&native_tx(0, 10), 10, 0));
        // Time lock compares against the median time.
        let time_lock = LOCK_TIME_THRESHOLD + 500;
        assert!(is_finalized_transaction(
            &native_tx(0, time_lock),
            0,
            time_lock as i64 + 1
        ));
        assert!(!is_finalized_transaction(&native_tx(0, time_lock), 0, 0));
        // Maxed sequences short-circuit the lock time.
        assert!(is_finalized_transaction(
            &native_tx(MAX_TX_IN_SEQUENCE_NUM, 10),
            0,
            0
        ));
    }

    #[test]
    fn sanity_rejects_malformed_blocks() {
        let params = Params::regtest();
        let genesis = params.genesis.clone();

        // The pristine genesis passes.
        check_block_sanity(&genesis, &params, BF_NO_POW_CHECK).expect("genesis sanity");

        // Wrong version.
        let mut bad = genesis.clone();
        bad.header.version = 2;
        assert!(check_block_sanity(&bad, &params, BF_NO_POW_CHECK).is_err());

        // Tampered merkle root on a non-genesis block.
        let mut bad = genesis.clone();
        bad.header.parent_hashes = vec![[1u8; 32]];
        bad.header.hash_merkle_root[0] ^= 1;
        let err = check_block_sanity(&bad, &params, BF_NO_POW_CHECK).expect_err("bad merkle");
        assert!(matches!(err, DagError::Rule(RuleError::BadMerkleRoot)));

        // Duplicate parents.
        let mut bad = genesis.clone();
        bad.header.parent_hashes = vec![[1u8; 32], [1u8; 32]];
        assert!(check_block_sanity(&bad, &params, BF_NO_POW_CHECK).is_err());

        // A parentless block that is not genesis.
        let mut bad = genesis.clone();
        bad.header.nonce += 1;
        assert!(check_block_sanity(&bad, &params, BF_NO_POW_CHECK).is_err());
    }
}
