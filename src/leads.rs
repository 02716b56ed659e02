//! Lead tracking: turns deposit and withdraw logs into per-address candidate
//! records and runs resumable discovery passes over block ranges.

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};

use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    contracts::{IERC4626, IERC7540},
    error::{IngestError, IngestResult},
    node::{ConnectionProvider, RawLog},
    progress::{NoProgress, ProgressReporter, ScanProgress},
    scanner::{self, ChunkLogs, EventFilter, ScanOptions},
    types::BlockRange,
    utils::unix_to_datetime,
};

/// A contract address suspected of being a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub chain_id: u64,
    pub address: Address,
    pub first_seen_at_block: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at_block: u64,
    pub deposit_count: u64,
    pub withdraw_count: u64,
}

impl Lead {
    /// Both flows observed at least once.
    pub fn is_candidate(&self) -> bool {
        self.deposit_count > 0 && self.withdraw_count > 0
    }

    /// Folds an older record of the same address in without ever lowering a
    /// counter.
    fn absorb(&mut self, other: &Lead) {
        if other.first_seen_at_block < self.first_seen_at_block {
            self.first_seen_at_block = other.first_seen_at_block;
            self.first_seen_at = other.first_seen_at;
        }
        self.last_seen_at_block = self.last_seen_at_block.max(other.last_seen_at_block);
        self.deposit_count = self.deposit_count.max(other.deposit_count);
        self.withdraw_count = self.withdraw_count.max(other.withdraw_count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Deposit,
    Withdraw,
}

/// Which first topics count as deposits or withdrawals, and which emitters
/// are known to be broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadRules {
    pub deposit_topics: BTreeSet<B256>,
    pub withdraw_topics: BTreeSet<B256>,
    /// tracked and counted, never promoted to a detection
    pub deny_list: BTreeSet<Address>,
}

impl Default for LeadRules {
    fn default() -> Self {
        Self {
            deposit_topics: BTreeSet::from([
                IERC4626::Deposit::SIGNATURE_HASH,
                IERC7540::DepositRequest::SIGNATURE_HASH,
            ]),
            withdraw_topics: BTreeSet::from([
                IERC4626::Withdraw::SIGNATURE_HASH,
                IERC7540::RedeemRequest::SIGNATURE_HASH,
            ]),
            deny_list: BTreeSet::new(),
        }
    }
}

impl LeadRules {
    pub fn with_deny_list(mut self, deny: impl IntoIterator<Item = Address>) -> Self {
        self.deny_list.extend(deny);
        self
    }

    pub fn kind(&self, topic0: &B256) -> Option<EventKind> {
        if self.deposit_topics.contains(topic0) {
            Some(EventKind::Deposit)
        } else if self.withdraw_topics.contains(topic0) {
            Some(EventKind::Withdraw)
        } else {
            None
        }
    }

    /// Log query matching every deposit and withdraw topic from any emitter.
    pub fn event_filter(&self) -> EventFilter {
        EventFilter::new(
            self.deposit_topics
                .iter()
                .chain(self.withdraw_topics.iter())
                .copied()
                .collect(),
        )
    }
}

/// Immutable snapshot of discovery state: every lead plus the last block
/// whose logs are fully reflected in it.
///
/// `last_scanned_block` is a high-water mark. Blocks at or below it are
/// treated as covered whether or not a pass actually fetched them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "crate::utils::serde_lead_map")]
    pub leads: BTreeMap<Address, Lead>,
    pub last_scanned_block: Option<u64>,
}

impl Checkpoint {
    pub fn new(leads: impl IntoIterator<Item = Lead>, last_scanned_block: Option<u64>) -> Self {
        Self {
            leads: leads.into_iter().map(|l| (l.address, l)).collect(),
            last_scanned_block,
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Lead> {
        self.leads.values().filter(|l| l.is_candidate())
    }

    /// Window for the next pass up to `end`. Without an explicit `start` it
    /// begins at the last scanned block, which the pass skips, so one new
    /// block still forms a valid window. `None` when nothing past the
    /// checkpoint is left.
    pub fn resume_range(&self, start: Option<u64>, end: u64) -> IngestResult<Option<BlockRange>> {
        let start = match (start, self.last_scanned_block) {
            (Some(start), _) => start,
            (None, Some(last)) if last >= end => return Ok(None),
            (None, Some(last)) => last,
            (None, None) => 0,
        };
        Ok(Some(BlockRange::new(start, end)?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounters {
    /// leads known before the pass started
    pub old_leads: usize,
    /// leads created during the pass
    pub new_leads: usize,
    pub deposits: u64,
    pub withdrawals: u64,
    /// events from deny-listed emitters
    pub denied: u64,
    pub logs: u64,
}

/// Result of one discovery pass over the requested `[start_block, end_block]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(with = "crate::utils::serde_lead_map")]
    pub leads: BTreeMap<Address, Lead>,
    /// candidate leads not on the deny list
    #[serde(with = "crate::utils::serde_lead_map")]
    pub detections: BTreeMap<Address, Lead>,
    pub counters: ScanCounters,
    pub start_block: u64,
    pub end_block: u64,
    /// blocks whose logs this pass fetched; `None` when the seed already
    /// covered the whole window
    pub scanned: Option<BlockRange>,
}

/// Accumulates leads from logs. Only ever touched by one task.
#[derive(Debug, Clone)]
pub struct LeadTracker {
    chain_id: u64,
    rules: Arc<LeadRules>,
    leads: BTreeMap<Address, Lead>,
    /// events at or below this block are already reflected in the seed
    floor: Option<u64>,
    last_scanned_block: Option<u64>,
    counters: ScanCounters,
}

impl LeadTracker {
    pub fn new(chain_id: u64, rules: Arc<LeadRules>) -> Self {
        Self {
            chain_id,
            rules,
            leads: BTreeMap::new(),
            floor: None,
            last_scanned_block: None,
            counters: ScanCounters::default(),
        }
    }

    pub fn from_checkpoint(chain_id: u64, rules: Arc<LeadRules>, checkpoint: &Checkpoint) -> Self {
        let mut tracker = Self::new(chain_id, rules);
        tracker.seed_existing_leads(checkpoint.leads.values().cloned());
        tracker.floor = checkpoint.last_scanned_block;
        tracker.last_scanned_block = checkpoint.last_scanned_block;
        tracker
    }

    /// Merges previously known leads in. Counters only ever go up.
    pub fn seed_existing_leads(&mut self, leads: impl IntoIterator<Item = Lead>) {
        for lead in leads {
            match self.leads.entry(lead.address) {
                Entry::Occupied(mut e) => e.get_mut().absorb(&lead),
                Entry::Vacant(e) => {
                    e.insert(lead);
                    self.counters.old_leads += 1;
                }
            }
        }
    }

    /// Applies one log. Returns the event kind if the log was counted.
    pub fn ingest(&mut self, log: &RawLog) -> Option<EventKind> {
        let kind = self.rules.kind(log.topics.first()?)?;
        if self.floor.is_some_and(|floor| log.block_number <= floor) {
            return None;
        }

        self.counters.logs += 1;
        if self.rules.deny_list.contains(&log.address) {
            self.counters.denied += 1;
        }

        let lead = match self.leads.entry(log.address) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.counters.new_leads += 1;
                e.insert(Lead {
                    chain_id: self.chain_id,
                    address: log.address,
                    first_seen_at_block: log.block_number,
                    first_seen_at: unix_to_datetime(log.block_timestamp.unwrap_or_default()),
                    last_seen_at_block: log.block_number,
                    deposit_count: 0,
                    withdraw_count: 0,
                })
            }
        };

        let was_candidate = lead.is_candidate();
        lead.last_seen_at_block = lead.last_seen_at_block.max(log.block_number);
        match kind {
            EventKind::Deposit => {
                lead.deposit_count += 1;
                self.counters.deposits += 1;
            }
            EventKind::Withdraw => {
                lead.withdraw_count += 1;
                self.counters.withdrawals += 1;
            }
        }

        if !was_candidate && lead.is_candidate() {
            debug!(
                target: "vault_ingest::leads",
                address = %log.address,
                block = log.block_number,
                "lead became a candidate"
            );
        }

        Some(kind)
    }

    /// Applies a whole chunk and marks it scanned.
    pub fn ingest_chunk(&mut self, chunk: &ChunkLogs) {
        for log in &chunk.logs {
            self.ingest(log);
        }
        let end = chunk.chunk.range.end();
        self.last_scanned_block = Some(self.last_scanned_block.map_or(end, |b| b.max(end)));
    }

    pub fn leads(&self) -> &BTreeMap<Address, Lead> {
        &self.leads
    }

    pub fn counters(&self) -> ScanCounters {
        self.counters
    }

    pub fn candidate_count(&self) -> usize {
        self.leads
            .values()
            .filter(|l| l.is_candidate() && !self.rules.deny_list.contains(&l.address))
            .count()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            leads: self.leads.clone(),
            last_scanned_block: self.last_scanned_block,
        }
    }

    pub fn report(&self, range: BlockRange, scanned: Option<BlockRange>) -> ScanReport {
        let detections = self
            .leads
            .iter()
            .filter(|(address, lead)| lead.is_candidate() && !self.rules.deny_list.contains(*address))
            .map(|(address, lead)| (*address, lead.clone()))
            .collect();

        ScanReport {
            leads: self.leads.clone(),
            detections,
            counters: self.counters,
            start_block: range.start(),
            end_block: range.end(),
            scanned,
        }
    }
}

/// One configured discovery pass.
#[derive(Clone)]
pub struct Discovery {
    pub chain_id: u64,
    pub rules: Arc<LeadRules>,
    pub options: ScanOptions,
    pub progress: Arc<dyn ProgressReporter>,
}

impl Discovery {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            rules: Arc::new(LeadRules::default()),
            options: ScanOptions::default(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_rules(mut self, rules: Arc<LeadRules>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Scans `range` on top of `seed` and returns the report together with the
    /// new checkpoint. `seed` itself is never modified.
    ///
    /// Re-running a window already covered by `seed` changes nothing. On
    /// failure or cancellation the error carries a checkpoint covering every
    /// chunk ingested before it, see [`IngestError::resume_checkpoint`].
    pub async fn discover(
        &self,
        provider: &dyn ConnectionProvider,
        seed: &Checkpoint,
        range: BlockRange,
        cancel: &CancellationToken,
    ) -> IngestResult<(ScanReport, Checkpoint)> {
        if range.start() >= range.end() {
            return Err(IngestError::config(format!(
                "discovery needs start < end, got {range}"
            )));
        }

        let mut tracker = LeadTracker::from_checkpoint(self.chain_id, self.rules.clone(), seed);

        // blocks at or below the seed's last scanned block cannot change anything
        let from = match seed.last_scanned_block {
            Some(last) if last >= range.end() => {
                info!(target: "vault_ingest::leads", %range, "range already covered by checkpoint");
                return Ok((tracker.report(range, None), tracker.checkpoint()));
            }
            Some(last) if last >= range.start() => last + 1,
            _ => range.start(),
        };
        let to_scan = BlockRange::new(from, range.end())?;

        let mut chunks = scanner::scan_chunks(
            provider,
            &self.rules.event_filter(),
            to_scan,
            &self.options,
            cancel,
        )?;

        let mut consumed = 0;
        let mut current_timestamp = None;
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(e.with_checkpoint(tracker.checkpoint())),
            };

            tracker.ingest_chunk(&chunk);
            consumed += chunk.chunk.range.len();
            if let Some(ts) = chunk.logs.last().and_then(|l| l.block_timestamp) {
                current_timestamp = Some(ts);
            }

            self.progress.report(&ScanProgress {
                blocks_consumed: consumed,
                total_blocks: to_scan.len(),
                current_timestamp,
                candidate_count: tracker.candidate_count(),
            });
        }

        let report = tracker.report(range, Some(to_scan));
        info!(
            target: "vault_ingest::leads",
            %range,
            leads = report.leads.len(),
            detections = report.detections.len(),
            new_leads = report.counters.new_leads,
            "discovery pass finished"
        );

        Ok((report, tracker.checkpoint()))
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{address, Bytes};

    use super::*;

    const VAULT: Address = address!("1111111111111111111111111111111111111111");
    const OTHER: Address = address!("2222222222222222222222222222222222222222");

    fn log(address: Address, kind: EventKind, block: u64) -> RawLog {
        let topic = match kind {
            EventKind::Deposit => IERC4626::Deposit::SIGNATURE_HASH,
            EventKind::Withdraw => IERC7540::RedeemRequest::SIGNATURE_HASH,
        };
        RawLog {
            address,
            topics: vec![topic],
            data: Bytes::new(),
            block_number: block,
            log_index: 0,
            transaction_hash: None,
            block_timestamp: Some(1_000 + block),
        }
    }

    fn tracker() -> LeadTracker {
        LeadTracker::new(1, Arc::new(LeadRules::default()))
    }

    #[test]
    fn test_lead_lifecycle() {
        let mut t = tracker();
        t.ingest(&log(VAULT, EventKind::Deposit, 10));
        let lead = &t.leads()[&VAULT];
        assert_eq!(lead.first_seen_at_block, 10);
        assert_eq!(lead.first_seen_at.timestamp(), 1_010);
        assert!(!lead.is_candidate());

        t.ingest(&log(VAULT, EventKind::Deposit, 11));
        t.ingest(&log(VAULT, EventKind::Deposit, 12));
        assert!(!t.leads()[&VAULT].is_candidate());

        t.ingest(&log(VAULT, EventKind::Withdraw, 13));
        let lead = &t.leads()[&VAULT];
        assert!(lead.is_candidate());
        assert_eq!((lead.deposit_count, lead.withdraw_count), (3, 1));
        assert_eq!(lead.last_seen_at_block, 13);
        assert_eq!(t.counters().new_leads, 1);
    }

    #[test]
    fn test_unrelated_topics_ignored() {
        let mut t = tracker();
        let mut other = log(VAULT, EventKind::Deposit, 1);
        other.topics = vec![B256::ZERO];
        assert_eq!(t.ingest(&other), None);
        other.topics.clear();
        assert_eq!(t.ingest(&other), None);
        assert!(t.leads().is_empty());
    }

    #[test]
    fn test_seeding_never_lowers_counters() {
        let mut t = tracker();
        for b in 0..4 {
            t.ingest(&log(VAULT, EventKind::Deposit, 20 + b));
        }
        let mut stale = t.leads()[&VAULT].clone();
        stale.deposit_count = 1;
        stale.withdraw_count = 2;
        stale.first_seen_at_block = 5;

        t.seed_existing_leads([stale]);
        let lead = &t.leads()[&VAULT];
        assert_eq!(lead.deposit_count, 4);
        assert_eq!(lead.withdraw_count, 2);
        assert_eq!(lead.first_seen_at_block, 5);
    }

    #[test]
    fn test_rescanning_covered_blocks_is_noop() {
        let logs = [
            log(VAULT, EventKind::Deposit, 100),
            log(VAULT, EventKind::Withdraw, 150),
            log(OTHER, EventKind::Deposit, 160),
        ];
        let mut first = tracker();
        logs.iter().for_each(|l| {
            first.ingest(l);
        });
        let checkpoint = Checkpoint::new(first.leads().values().cloned(), Some(200));

        let mut again = LeadTracker::from_checkpoint(1, Arc::new(LeadRules::default()), &checkpoint);
        logs.iter().for_each(|l| {
            again.ingest(l);
        });
        assert_eq!(again.checkpoint().leads, checkpoint.leads);
        assert_eq!(again.counters().old_leads, 2);
        assert_eq!(again.counters().logs, 0);

        again.ingest(&log(VAULT, EventKind::Withdraw, 201));
        assert_eq!(again.leads()[&VAULT].withdraw_count, 2);
    }

    #[test]
    fn test_denied_addresses_counted_but_not_detected() {
        let rules = LeadRules::default().with_deny_list([VAULT]);
        let mut t = LeadTracker::new(1, Arc::new(rules));
        t.ingest(&log(VAULT, EventKind::Deposit, 1));
        t.ingest(&log(VAULT, EventKind::Withdraw, 2));
        t.ingest(&log(OTHER, EventKind::Deposit, 3));
        t.ingest(&log(OTHER, EventKind::Withdraw, 4));

        let report = t.report(BlockRange::new(0, 10).unwrap(), None);
        assert!(report.leads[&VAULT].is_candidate());
        assert_eq!(report.counters.denied, 2);
        assert_eq!(report.detections.keys().collect::<Vec<_>>(), vec![&OTHER]);
        assert_eq!(t.candidate_count(), 1);
    }

    #[test]
    fn test_resume_range() {
        let fresh = Checkpoint::default();
        assert_eq!(fresh.resume_range(None, 50).unwrap(), BlockRange::new(0, 50).ok());

        let checkpoint = Checkpoint::new([], Some(200));
        assert_eq!(checkpoint.resume_range(None, 200).unwrap(), None);
        assert_eq!(checkpoint.resume_range(None, 150).unwrap(), None);
        // one new block still leaves a start < end window
        assert_eq!(checkpoint.resume_range(None, 201).unwrap(), BlockRange::new(200, 201).ok());
        assert_eq!(checkpoint.resume_range(Some(10), 201).unwrap(), BlockRange::new(10, 201).ok());
        assert!(checkpoint.resume_range(Some(300), 201).is_err());
    }

    #[test]
    fn test_checkpoint_json_round_trip() {
        let mut t = tracker();
        t.ingest(&log(VAULT, EventKind::Deposit, 7));
        let checkpoint = t.checkpoint();

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_event_filter_covers_both_kinds() {
        let filter = LeadRules::default().event_filter();
        assert_eq!(filter.topics0.len(), 4);
        assert!(filter.addresses.is_empty());
    }
}
