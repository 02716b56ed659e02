use std::{str::FromStr, sync::Arc, time::Duration};

use alloy_primitives::Address;
use clap::Parser;
use cli::{CliCmd, Command, LimitArgs};
use db::{BufferedPointWriter, JsonFileStore, LeadStore, PointRecord};
use eyre::{eyre, WrapErr};
use futures::StreamExt;
use itertools::Itertools;
use node::{ConnectionProvider, HttpConnectionProvider};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use types::BlockTag;

pub mod aux;
pub mod classify;
pub mod cli;
pub mod contracts;
pub mod db;
pub mod error;
pub mod handler;
pub mod history;
pub mod leads;
pub mod multicall;
pub mod node;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod scanner;
pub mod types;
pub mod utils;

pub use error::{IngestError, IngestResult};

pub fn run() -> eyre::Result<()> {
    let cli = CliCmd::parse();
    aux::init_all(&aux::LogSettings::new(cli.log.directive()).with_target(!cli.log.hide_target));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(execute(cli))
}

async fn execute(cli: CliCmd) -> eyre::Result<()> {
    let rpc_url = cli
        .rpc_url
        .as_deref()
        .ok_or_else(|| eyre!("no rpc url, pass --rpc-url or set 'JSON_RPC_URL' in .env"))?;
    let provider = Arc::new(build_provider(rpc_url, &cli.limits)?);
    let store = JsonFileStore::new(&cli.data_dir)?;

    let node = provider.connect()?;
    let chain_id = node.chain_id().await.wrap_err("reading chain id")?;
    let tip = node.block_number().await.wrap_err("reading chain tip")?;
    info!(target: "vault_ingest", chain_id, tip, data_dir = %cli.data_dir.display(), "connected");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "vault_ingest", "interrupted, stopping");
            ctrl_c.cancel();
        }
    });

    let limits = provider.limits();
    let workers = cli.limits.workers;
    match cli.command {
        Command::Scan {
            start_block,
            end_block,
            deny,
        } => {
            let deny = deny
                .iter()
                .map(|a| Address::from_str(a).wrap_err_with(|| format!("bad deny-list address {a}")))
                .collect::<eyre::Result<Vec<_>>>()?;
            let seed = store.load(None).await?;
            let end = end_block.unwrap_or(tip);
            let Some(range) = seed.resume_range(start_block, end)? else {
                info!(
                    target: "vault_ingest",
                    last_scanned_block = ?seed.last_scanned_block,
                    end,
                    "checkpoint already covers the requested blocks"
                );
                return Ok(());
            };

            let discovery = leads::Discovery::new(chain_id)
                .with_rules(Arc::new(leads::LeadRules::default().with_deny_list(deny)))
                .with_options(scanner::ScanOptions::default().with_worker_count(workers))
                .with_progress(Arc::new(progress::TracingProgress));

            match discovery
                .discover(provider.as_ref(), &seed, range, &cancel)
                .await
            {
                Ok((report, checkpoint)) => {
                    store.save(&checkpoint).await?;
                    info!(
                        target: "vault_ingest",
                        detections = %report.detections.keys().join(","),
                        "{} candidate vaults out of {} leads",
                        report.detections.len(),
                        report.leads.len()
                    );
                }
                Err(e) => {
                    if let Some(checkpoint) = e.resume_checkpoint() {
                        store.save(checkpoint).await?;
                        error!(
                            target: "vault_ingest",
                            last_scanned_block = ?checkpoint.last_scanned_block,
                            "saved partial checkpoint"
                        );
                    }
                    return Err(e.into());
                }
            }
        }
        Command::Classify { block } => {
            let checkpoint = store.load(None).await?;
            let addresses = checkpoint.candidates().map(|l| l.address).collect_vec();
            let classifier = classify::Classifier::new(
                Arc::new(classify::RuleTable::default()),
                call_options(workers, &limits),
            );

            let report = classifier
                .classify(
                    provider.as_ref(),
                    &addresses,
                    BlockTag::Number(block.unwrap_or(tip)),
                    chain_id,
                    &cancel,
                )
                .await?;
            for ambiguity in &report.ambiguities {
                warn!(
                    target: "vault_ingest",
                    address = %ambiguity.address,
                    tags = %ambiguity.tags.iter().join(","),
                    "ambiguous classification"
                );
            }

            let mut stored = store.load_features().await?;
            stored.features.extend(report.features.clone());
            stored.ambiguities = report.ambiguities;
            stored.unresolved = report.unresolved;
            store.save_features(&stored).await?;
            info!(
                target: "vault_ingest",
                classified = report.features.len(),
                unresolved = stored.unresolved.len(),
                "classification stored"
            );
        }
        Command::History {
            start_block,
            end_block,
            step,
            insert_size,
        } => {
            let end = end_block.unwrap_or(tip);
            let plan = history::SamplingPlan::new(start_block, end, step)?;
            let checkpoint = store.load(None).await?;
            let features = store.load_features().await?;

            let seeds = features
                .features
                .into_values()
                .map(|features| history::VaultSeed {
                    first_seen_block: checkpoint
                        .leads
                        .get(&features.address)
                        .map(|l| l.first_seen_at_block)
                        .unwrap_or_default(),
                    features,
                })
                .collect_vec();

            let options = call_options(workers, &limits);
            let described = history::describe_vaults(
                provider.as_ref(),
                chain_id,
                &seeds,
                BlockTag::Number(end),
                &options,
                &cancel,
            )
            .await?;
            for (address, reason) in &described.failures {
                warn!(target: "vault_ingest", %address, "not sampling - {reason}");
            }

            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let writer = tokio::spawn(BufferedPointWriter::new(Arc::new(store.clone()), rx, insert_size));

            let reconstructor = history::Reconstructor::new(
                Arc::new(history::CapabilityTable::default()),
                options,
            );
            let provider: Arc<dyn ConnectionProvider> = provider;
            let mut points = std::pin::pin!(reconstructor
                .reconstruct(provider, described.vaults, plan, cancel.clone())
                .ready_chunks(64));

            let mut failed_blocks = 0usize;
            while let Some(batch) = points.next().await {
                let records = batch
                    .into_iter()
                    .filter_map(|item| match item {
                        Ok((vault, point)) => Some(PointRecord { vault, point }),
                        Err(e) => {
                            failed_blocks += 1;
                            warn!(target: "vault_ingest", "block not sampled - {e}");
                            None
                        }
                    })
                    .collect_vec();
                if !records.is_empty() && tx.send(records).is_err() {
                    break;
                }
            }
            drop(tx);

            let written = writer.await??;
            info!(target: "vault_ingest", written, failed_blocks, "history stored");
        }
    }

    Ok(())
}

fn build_provider(rpc_url: &str, args: &LimitArgs) -> eyre::Result<HttpConnectionProvider> {
    let provider = HttpConnectionProvider::new(rpc_url)?;
    let mut limits = provider.limits();
    if let Some(span) = args.max_block_span {
        limits = limits.with_max_block_span(span);
    }
    if let Some(calls) = args.max_calls_per_request {
        limits = limits.with_max_calls_per_request(calls);
    }
    if let Some(secs) = args.timeout {
        limits = limits.with_request_timeout(Duration::from_secs(secs));
    }
    Ok(provider.with_limits(limits))
}

fn call_options(workers: usize, limits: &planner::ProviderLimits) -> multicall::CallOptions {
    multicall::CallOptions::default()
        .with_worker_count(workers)
        .with_max_calls_per_request(limits.max_calls_per_request)
}
