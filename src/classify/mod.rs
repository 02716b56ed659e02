//! Protocol classification by speculative probe calls.

mod rules;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use alloy_primitives::Address;
use dashmap::DashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::rules::{ChainRestriction, FeatureTag, ProbeSpec, RuleTable};
use crate::{
    error::IngestResult,
    multicall::{self, CallOptions},
    node::ConnectionProvider,
    types::{BlockTag, CallResult, VaultId},
};

/// Tags recognised on one address. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub address: Address,
    pub tags: BTreeSet<FeatureTag>,
}

impl FeatureSet {
    pub fn new(address: Address, tags: impl IntoIterator<Item = FeatureTag>) -> Self {
        Self {
            address,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn broken(address: Address) -> Self {
        Self::new(address, [FeatureTag::Broken])
    }

    pub fn has(&self, tag: FeatureTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn is_broken(&self) -> bool {
        self.has(FeatureTag::Broken)
    }
}

/// More than one tag of an exclusive group matched the same address. All
/// matching tags are kept; the rule table needs fixing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationAmbiguity {
    pub address: Address,
    pub tags: BTreeSet<FeatureTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationReport {
    #[serde(with = "crate::utils::serde_feature_map")]
    pub features: BTreeMap<Address, FeatureSet>,
    pub ambiguities: Vec<ClassificationAmbiguity>,
    /// core probes could not be delivered; retry in a later run
    pub unresolved: Vec<Address>,
}

/// Latest feature set per vault. A new classification replaces the stored
/// entry, it never edits it.
#[derive(Debug, Default, Clone)]
pub struct FeatureCache {
    entries: Arc<DashMap<VaultId, Arc<FeatureSet>>>,
}

impl FeatureCache {
    pub fn get(&self, id: &VaultId) -> Option<Arc<FeatureSet>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn replace(&self, id: VaultId, features: FeatureSet) {
        self.entries.insert(id, Arc::new(features));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Classifier {
    rules: Arc<RuleTable>,
    options: CallOptions,
    cache: FeatureCache,
}

/// Probe results gathered for one address.
#[derive(Default)]
struct Evidence {
    core_failed: bool,
    core_undelivered: bool,
    /// tag -> (probes issued, probes answered)
    tags: BTreeMap<FeatureTag, (usize, usize)>,
    undelivered: bool,
}

impl Classifier {
    pub fn new(rules: Arc<RuleTable>, options: CallOptions) -> Self {
        Self {
            rules,
            options,
            cache: FeatureCache::default(),
        }
    }

    pub fn with_cache(mut self, cache: FeatureCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    /// Probes every address at `block` and derives its feature set.
    ///
    /// All probes for all addresses go out as one batch; a failure on one
    /// address never affects another.
    pub async fn classify(
        &self,
        provider: &dyn ConnectionProvider,
        addresses: &[Address],
        block: BlockTag,
        chain_id: u64,
        cancel: &CancellationToken,
    ) -> IngestResult<ClassificationReport> {
        let addresses: IndexSet<Address> = addresses.iter().copied().collect();

        let mut calls = Vec::new();
        let mut owners = Vec::new();
        for (i, address) in addresses.iter().enumerate() {
            for (core, probe) in self.rules.probes_for(chain_id) {
                calls.push(probe.for_target(*address));
                owners.push((i, core, probe.tag));
            }
        }

        debug!(
            target: "vault_ingest::classify",
            addresses = addresses.len(),
            probes = calls.len(),
            chain_id,
            %block,
            "probing"
        );

        let results = multicall::execute(provider, &calls, block, &self.options, cancel).await?;

        let mut evidence: Vec<Evidence> = addresses.iter().map(|_| Evidence::default()).collect();
        for ((i, core, tag), result) in owners.into_iter().zip(&results) {
            record(&mut evidence[i], core, tag, result);
        }

        let mut report = ClassificationReport::default();
        for (address, evidence) in addresses.into_iter().zip(evidence) {
            let Some(features) = self.decide(address, &evidence) else {
                report.unresolved.push(address);
                continue;
            };

            for group in &self.rules.exclusive_groups {
                let matched: BTreeSet<_> = group.intersection(&features.tags).copied().collect();
                if matched.len() > 1 {
                    warn!(
                        target: "vault_ingest::classify",
                        %address,
                        ?matched,
                        "ambiguous classification"
                    );
                    report.ambiguities.push(ClassificationAmbiguity {
                        address,
                        tags: matched,
                    });
                }
            }

            self.cache
                .replace(VaultId::new(chain_id, address), features.clone());
            report.features.insert(address, features);
        }

        info!(
            target: "vault_ingest::classify",
            classified = report.features.len(),
            broken = report.features.values().filter(|f| f.is_broken()).count(),
            ambiguous = report.ambiguities.len(),
            unresolved = report.unresolved.len(),
            "classification finished"
        );

        Ok(report)
    }

    /// `None` when the evidence is incomplete because probes never reached
    /// the node.
    fn decide(&self, address: Address, evidence: &Evidence) -> Option<FeatureSet> {
        if evidence.core_failed {
            return Some(FeatureSet::broken(address));
        }
        if evidence.core_undelivered || evidence.undelivered {
            return None;
        }

        Some(FeatureSet::new(
            address,
            evidence
                .tags
                .iter()
                .filter(|(_, (issued, answered))| *issued > 0 && issued == answered)
                .map(|(tag, _)| *tag),
        ))
    }
}

fn record(evidence: &mut Evidence, core: bool, tag: FeatureTag, result: &CallResult) {
    let entry = evidence.tags.entry(tag).or_default();
    entry.0 += 1;

    match result.failure() {
        None => entry.1 += 1,
        Some(failure) if failure.is_transport() => {
            if core {
                evidence.core_undelivered = true;
            } else {
                evidence.undelivered = true;
            }
        }
        Some(_) if core => evidence.core_failed = true,
        Some(_) => {}
    }
}
