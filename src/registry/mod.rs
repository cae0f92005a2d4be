//! Instrument registry: the refreshable set of monitored symbols.
//!
//! Symbols come from a [`SymbolSource`] (exchange listing or a symbols
//! file), are normalized by [`clean_symbol`] and then filtered by the
//! optional whitelist and the blacklist.

use crate::exchange::SymbolSource;
use crate::market::Instrument;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

fn url_prefix() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^https?://[^/]+/(?:futures(?:/perpetual)?/)?").ok())
        .as_ref()
}

fn symbol_format() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9_]+_USDT$").ok())
        .as_ref()
}

/// Normalize a raw symbol: strip an exchange URL prefix, trim, uppercase.
/// Returns `None` unless the result has the `BASE_USDT` contract form.
pub fn clean_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = url_prefix()?.replace(trimmed, "");
    let symbol = stripped.trim_end_matches('/').to_uppercase();
    symbol_format()?.is_match(&symbol).then_some(symbol)
}

/// Symbols read from a newline-separated file. Blank lines and `#`
/// comments are ignored.
#[derive(Debug, Clone)]
pub struct FileSymbolSource {
    path: PathBuf,
}

impl FileSymbolSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SymbolSource for FileSymbolSource {
    async fn list_active_symbols(&self) -> Result<Vec<Instrument>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read symbols file {}", self.path.display()))?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(Instrument::new)
            .collect())
    }
}

/// Write a sorted, deduplicated symbols file, creating parent directories.
pub async fn write_symbols_file(path: &Path, symbols: &[String]) -> Result<usize> {
    let unique: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
    anyhow::ensure!(!unique.is_empty(), "Refusing to write an empty symbols file");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let body = unique.iter().copied().collect::<Vec<_>>().join("\n");
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(unique.len())
}

/// Difference between two registry snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The current, filtered instrument set.
pub struct InstrumentRegistry {
    source: Arc<dyn SymbolSource>,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
    instruments: Vec<Instrument>,
}

impl InstrumentRegistry {
    pub fn new(source: Arc<dyn SymbolSource>, whitelist: &[String], blacklist: &[String]) -> Self {
        let normalize = |list: &[String]| -> HashSet<String> {
            list.iter()
                .filter_map(|raw| {
                    let cleaned = clean_symbol(raw);
                    if cleaned.is_none() {
                        warn!(symbol = %raw, "Ignoring invalid filter entry");
                    }
                    cleaned
                })
                .collect()
        };

        Self {
            source,
            whitelist: normalize(whitelist),
            blacklist: normalize(blacklist),
            instruments: Vec::new(),
        }
    }

    /// Reload from the source. On error the previous snapshot is kept.
    pub async fn refresh(&mut self) -> Result<RegistryChange> {
        let raw = self.source.list_active_symbols().await?;
        let total = raw.len();

        let mut accepted = BTreeSet::new();
        for instrument in raw.into_iter().filter(|i| i.active) {
            let Some(symbol) = clean_symbol(&instrument.symbol) else {
                debug!(symbol = %instrument.symbol, "Skipping invalid symbol");
                continue;
            };
            if !self.whitelist.is_empty() && !self.whitelist.contains(&symbol) {
                continue;
            }
            if self.blacklist.contains(&symbol) {
                continue;
            }
            accepted.insert(symbol);
        }

        let previous: BTreeSet<String> = self.symbols().into_iter().collect();
        let change = RegistryChange {
            added: accepted.difference(&previous).cloned().collect(),
            removed: previous.difference(&accepted).cloned().collect(),
        };

        self.instruments = accepted.into_iter().map(Instrument::new).collect();
        info!(
            total,
            monitored = self.instruments.len(),
            added = change.added.len(),
            removed = change.removed.len(),
            "Instrument registry refreshed"
        );
        Ok(change)
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    /// Monitored symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.symbol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockSymbolSource;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_clean_symbol() {
        assert_eq!(clean_symbol("btc_usdt"), Some("BTC_USDT".to_string()));
        assert_eq!(clean_symbol("  ETH_USDT \n"), Some("ETH_USDT".to_string()));
        assert_eq!(
            clean_symbol("https://futures.mexc.com/futures/perpetual/SOL_USDT"),
            Some("SOL_USDT".to_string())
        );
        assert_eq!(
            clean_symbol("HTTPS://www.mexc.com/futures/1000PEPE_USDT"),
            Some("1000PEPE_USDT".to_string())
        );
        assert_eq!(clean_symbol("BTC_USD"), None);
        assert_eq!(clean_symbol("BTC-USDT"), None);
        assert_eq!(clean_symbol(""), None);
    }

    #[tokio::test]
    async fn test_refresh_filters_and_reports_changes() {
        let mut source = MockSymbolSource::new();
        let mut calls = 0;
        source.expect_list_active_symbols().times(2).returning(move || {
            calls += 1;
            let mut list = vec![
                Instrument::new("btc_usdt"),
                Instrument::new("ETH_USDT"),
                Instrument::new("SHIB_USDT"),
                Instrument::new("BAD-SYMBOL"),
                Instrument {
                    symbol: "DEAD_USDT".to_string(),
                    active: false,
                },
            ];
            if calls == 2 {
                list.retain(|i| i.symbol != "ETH_USDT");
                list.push(Instrument::new("SOL_USDT"));
            }
            Ok(list)
        });

        let mut registry =
            InstrumentRegistry::new(Arc::new(source), &[], &strings(&["shib_usdt"]));

        let change = registry.refresh().await.unwrap();
        assert_eq!(registry.symbols(), strings(&["BTC_USDT", "ETH_USDT"]));
        assert_eq!(change.added, strings(&["BTC_USDT", "ETH_USDT"]));

        let change = registry.refresh().await.unwrap();
        assert_eq!(registry.symbols(), strings(&["BTC_USDT", "SOL_USDT"]));
        assert_eq!(change.added, strings(&["SOL_USDT"]));
        assert_eq!(change.removed, strings(&["ETH_USDT"]));
    }

    #[tokio::test]
    async fn test_whitelist_restricts() {
        let mut source = MockSymbolSource::new();
        source.expect_list_active_symbols().returning(|| {
            Ok(vec![Instrument::new("BTC_USDT"), Instrument::new("ETH_USDT")])
        });

        let mut registry = InstrumentRegistry::new(Arc::new(source), &strings(&["eth_usdt"]), &[]);
        registry.refresh().await.unwrap();
        assert_eq!(registry.symbols(), strings(&["ETH_USDT"]));

        let change = registry.refresh().await.unwrap();
        assert!(change.is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let mut source = MockSymbolSource::new();
        let mut first = true;
        source.expect_list_active_symbols().returning(move || {
            if std::mem::take(&mut first) {
                Ok(vec![Instrument::new("BTC_USDT")])
            } else {
                Err(anyhow::anyhow!("listing unavailable"))
            }
        });

        let mut registry = InstrumentRegistry::new(Arc::new(source), &[], &[]);
        registry.refresh().await.unwrap();
        assert!(registry.refresh().await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_symbols_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("rsi-sentinel-{}", std::process::id()));
        let path = dir.join("data").join("symbols_usdt.txt");

        let written = write_symbols_file(&path, &strings(&["SOL_USDT", "BTC_USDT", "SOL_USDT"]))
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "BTC_USDT\nSOL_USDT"
        );

        tokio::fs::write(&path, "# monitored\nBTC_USDT\n\n  eth_usdt  \n")
            .await
            .unwrap();
        let symbols: Vec<_> = FileSymbolSource::new(&path)
            .list_active_symbols()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.symbol)
            .collect();
        assert_eq!(symbols, strings(&["BTC_USDT", "eth_usdt"]));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_empty_symbols_file_refused() {
        let path = std::env::temp_dir().join("rsi-sentinel-empty.txt");
        assert!(write_symbols_file(&path, &[]).await.is_err());
    }
}
