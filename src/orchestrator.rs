//! End-to-end sync run: registry -> batched fetch -> per-file patch -> summary.
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::market::Market;
use crate::patcher::{FieldOutcome, FileStatus, Patcher};
use crate::providers::{PriceSource, MAX_BATCH_SIZE};
use crate::registry::RegistryEntry;

/// Deduplicated (market -> asin -> files) view of the registry.
///
/// Markets and ASINs keep first-appearance order so runs are reproducible.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    markets: IndexMap<Market, IndexMap<String, Vec<PathBuf>>>,
}

impl WorkingSet {
    pub fn from_entries(entries: &[RegistryEntry]) -> Self {
        let mut markets: IndexMap<Market, IndexMap<String, Vec<PathBuf>>> = IndexMap::new();
        for entry in entries {
            let files = markets
                .entry(entry.product.market)
                .or_default()
                .entry(entry.product.asin.clone())
                .or_default();
            for f in &entry.files {
                if !files.contains(f) {
                    files.push(f.clone());
                }
            }
        }
        Self { markets }
    }

    pub fn markets(&self) -> Vec<Market> {
        self.markets.keys().copied().collect()
    }

    /// ASINs configured for `market`, in registry order.
    pub fn asins(&self, market: Market) -> Vec<String> {
        self.markets
            .get(&market)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn files(&self, market: Market, asin: &str) -> &[PathBuf] {
        self.markets
            .get(&market)
            .and_then(|m| m.get(asin))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct (asin, market) pairs.
    pub fn len(&self) -> usize {
        self.markets.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `ids` into consecutive chunks of at most `size`.
pub fn partition_batches(ids: &[String], size: usize) -> Vec<Vec<String>> {
    ids.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Upstream,
    File,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncError {
    pub kind: ErrorKind,
    /// Market/batch or file path the error belongs to.
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceChange {
    pub asin: String,
    pub market: Market,
    pub file: PathBuf,
    pub line: usize,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub identifiers_checked: usize,
    pub quotes_received: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_missing: usize,
    pub files_without_identifier: usize,
    pub fields_updated: usize,
    pub fields_below_threshold: usize,
    pub no_quote: Vec<String>,
    pub changes: Vec<PriceChange>,
    pub errors: Vec<SyncError>,
}

impl RunSummary {
    fn new(source: &str, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.to_string(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            identifiers_checked: 0,
            quotes_received: 0,
            files_updated: 0,
            files_unchanged: 0,
            files_missing: 0,
            files_without_identifier: 0,
            fields_updated: 0,
            fields_below_threshold: 0,
            no_quote: Vec::new(),
            changes: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, kind: ErrorKind, subject: String, message: String) {
        self.errors.push(SyncError {
            kind,
            subject,
            message,
        });
    }

    /// Closing tally for the run log.
    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            source = %self.source,
            dry_run = self.dry_run,
            identifiers_checked = self.identifiers_checked,
            quotes_received = self.quotes_received,
            files_updated = self.files_updated,
            files_unchanged = self.files_unchanged,
            files_missing = self.files_missing,
            fields_updated = self.fields_updated,
            fields_below_threshold = self.fields_below_threshold,
            no_quote = self.no_quote.len(),
            errors = self.errors.len(),
            "price sync finished"
        );
        for e in &self.errors {
            warn!(kind = ?e.kind, subject = %e.subject, message = %e.message, "run error");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    /// Fixed pause between consecutive upstream calls.
    pub batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            batch_delay: Duration::from_millis(crate::registry::DEFAULT_BATCH_DELAY_MS),
        }
    }
}

pub struct SyncOrchestrator<'a> {
    source: &'a dyn PriceSource,
    patcher: Patcher,
    options: SyncOptions,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(source: &'a dyn PriceSource, patcher: Patcher, options: SyncOptions) -> Self {
        let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
        Self {
            source,
            patcher,
            options: SyncOptions {
                batch_size,
                ..options
            },
        }
    }

    /// Best-effort sweep over the working set. Never fails: upstream and file
    /// errors are collected in the summary.
    pub async fn run(&self, set: &WorkingSet) -> RunSummary {
        let mut summary = RunSummary::new(self.source.name(), self.patcher.dry_run);
        let mut first_call = true;

        for market in set.markets() {
            let asins = set.asins(market);
            let batches = partition_batches(&asins, self.options.batch_size);
            info!(%market, identifiers = asins.len(), batches = batches.len(), "syncing market");

            for (idx, batch) in batches.iter().enumerate() {
                if !first_call && !self.options.batch_delay.is_zero() {
                    tokio::time::sleep(self.options.batch_delay).await;
                }
                first_call = false;
                summary.identifiers_checked += batch.len();

                let prices = match self.source.fetch_prices(batch, market).await {
                    Ok(p) => p,
                    Err(e) => {
                        error!(%market, batch = idx + 1, error = %e, "batch fetch failed; skipping");
                        summary.record_error(
                            ErrorKind::Upstream,
                            format!("{market} batch {}", idx + 1),
                            format!("{e:#}"),
                        );
                        continue;
                    }
                };

                for asin in batch {
                    match prices.get(asin) {
                        Some(&price) => {
                            summary.quotes_received += 1;
                            info!(asin = %asin, %market, price, "quote received");
                            self.apply_quote(&mut summary, set, market, asin, price);
                        }
                        None => {
                            info!(asin = %asin, %market, "no quote; leaving files untouched");
                            summary.no_quote.push(format!("{asin}@{market}"));
                        }
                    }
                }
            }
        }

        summary.finished_at = Some(Utc::now());
        summary
    }

    fn apply_quote(
        &self,
        summary: &mut RunSummary,
        set: &WorkingSet,
        market: Market,
        asin: &str,
        price: f64,
    ) {
        let currency = market.currency();
        for path in set.files(market, asin) {
            let patch = match self.patcher.patch_file(path, asin, price, currency) {
                Ok(p) => p,
                Err(e) => {
                    error!(path = %path.display(), asin, error = %e, "template patch failed");
                    summary.record_error(
                        ErrorKind::File,
                        path.display().to_string(),
                        format!("{e:#}"),
                    );
                    continue;
                }
            };

            match patch.status {
                FileStatus::Updated => summary.files_updated += 1,
                FileStatus::Unchanged => summary.files_unchanged += 1,
                FileStatus::Missing => summary.files_missing += 1,
                FileStatus::IdentifierNotFound => {
                    warn!(path = %path.display(), asin, "identifier not declared in template");
                    summary.files_without_identifier += 1;
                }
            }

            for field in patch.fields {
                match field {
                    FieldOutcome::Updated { line, old, new, .. } => {
                        info!(
                            asin,
                            path = %path.display(),
                            line,
                            old = old.as_str(),
                            new = new.as_str(),
                            dry_run = self.patcher.dry_run,
                            "price updated"
                        );
                        summary.fields_updated += 1;
                        summary.changes.push(PriceChange {
                            asin: asin.to_string(),
                            market,
                            file: path.clone(),
                            line,
                            old,
                            new,
                        });
                    }
                    FieldOutcome::BelowThreshold { .. } | FieldOutcome::Current { .. } => {
                        summary.fields_below_threshold += 1;
                    }
                    FieldOutcome::Unparsable { .. } | FieldOutcome::NoPriceField { .. } => {}
                }
            }
        }
    }
}
