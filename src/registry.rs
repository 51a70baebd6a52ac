//! Static product registry: which ASIN lives in which template files.
//!
//! Loaded from a TOML file once per run and never mutated.
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::market::Market;
use crate::patcher::ScanRules;

pub const DEFAULT_THRESHOLD_PERCENT: f64 = 3.0;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 1500;

/// One product the site renders a price for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProductRef {
    pub asin: String,
    pub market: Market,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub product: ProductRef,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold_percent: f64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    pub settings: Settings,
    pub scan: ScanRules,
    pub entries: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    #[serde(default)]
    settings: SettingsCfg,
    #[serde(default)]
    scan: ScanCfg,
    #[serde(default)]
    products: Vec<ProductCfg>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsCfg {
    root: Option<PathBuf>,
    threshold_percent: Option<f64>,
    batch_size: Option<usize>,
    batch_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScanCfg {
    window: Option<usize>,
    identifier_pattern: Option<String>,
    price_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProductCfg {
    asin: String,
    market: String,
    files: Vec<PathBuf>,
}

/// Upper-case and validate a 10-character alphanumeric ASIN.
pub fn normalize_asin(raw: &str) -> Result<String> {
    let asin = raw.trim().to_ascii_uppercase();
    if asin.len() != 10 || !asin.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("invalid ASIN '{raw}': expected 10 alphanumeric characters");
    }
    Ok(asin)
}

impl Registry {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read registry {}", path.display()))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&raw, &base)
            .with_context(|| format!("parse registry {}", path.display()))
    }

    /// Parse registry TOML; relative file paths resolve against `[settings].root`,
    /// itself relative to `base_dir`.
    pub fn from_toml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let cfg: RegistryFile = toml::from_str(raw)?;

        let root = match cfg.settings.root {
            Some(r) if r.is_absolute() => r,
            Some(r) => base_dir.join(r),
            None => base_dir.to_path_buf(),
        };

        let settings = Settings {
            threshold_percent: cfg
                .settings
                .threshold_percent
                .unwrap_or(DEFAULT_THRESHOLD_PERCENT),
            batch_size: cfg.settings.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_delay_ms: cfg.settings.batch_delay_ms.unwrap_or(DEFAULT_BATCH_DELAY_MS),
        };
        if settings.threshold_percent.is_nan() || settings.threshold_percent < 0.0 {
            bail!("threshold_percent must be >= 0");
        }
        if settings.batch_size == 0 {
            bail!("batch_size must be > 0");
        }

        let mut scan = ScanRules::default();
        if let Some(window) = cfg.scan.window {
            scan.window = window;
        }
        if let Some(p) = cfg.scan.identifier_pattern.as_deref() {
            scan.identifier = Regex::new(p).context("scan.identifier_pattern")?;
        }
        if let Some(p) = cfg.scan.price_pattern.as_deref() {
            scan.price = Regex::new(p).context("scan.price_pattern")?;
            if scan.price.captures_len() < 2 {
                bail!("scan.price_pattern must capture the quoted value in a group");
            }
        }

        let mut entries = Vec::with_capacity(cfg.products.len());
        for p in cfg.products {
            let asin = normalize_asin(&p.asin)?;
            let market: Market = p
                .market
                .parse()
                .with_context(|| format!("product {asin}"))?;
            let files = p
                .files
                .into_iter()
                .map(|f| if f.is_absolute() { f } else { root.join(f) })
                .collect();
            entries.push(RegistryEntry {
                product: ProductRef { asin, market },
                files,
            });
        }

        Ok(Self {
            settings,
            scan,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_products_and_resolves_paths() {
        let raw = r#"
            [settings]
            root = "site"
            threshold_percent = 5.0

            [[products]]
            asin = "b0test0001"
            market = "DE"
            files = ["src/pages/index.astro", "/abs/page.astro"]
        "#;
        let reg = Registry::from_toml_str(raw, Path::new("/work")).unwrap();
        assert_eq!(reg.settings.threshold_percent, 5.0);
        assert_eq!(reg.settings.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(reg.scan.window, 10);
        let e = &reg.entries[0];
        assert_eq!(e.product.asin, "B0TEST0001");
        assert_eq!(e.product.market, Market::De);
        assert_eq!(e.files[0], PathBuf::from("/work/site/src/pages/index.astro"));
        assert_eq!(e.files[1], PathBuf::from("/abs/page.astro"));
    }

    #[test]
    fn rejects_malformed_asin() {
        let raw = r#"
            [[products]]
            asin = "B0SHORT"
            market = "de"
            files = []
        "#;
        assert!(Registry::from_toml_str(raw, Path::new(".")).is_err());
    }

    #[test]
    fn rejects_unknown_market_and_bad_pattern() {
        let raw = r#"
            [[products]]
            asin = "B0TEST0001"
            market = "jp"
            files = []
        "#;
        assert!(Registry::from_toml_str(raw, Path::new(".")).is_err());

        let raw = r#"
            [scan]
            price_pattern = "price: ("
        "#;
        assert!(Registry::from_toml_str(raw, Path::new(".")).is_err());
    }

    #[test]
    fn scan_overrides_apply() {
        let raw = r#"
            [scan]
            window = 4
            identifier_pattern = "\\bsku\\s*:"
        "#;
        let reg = Registry::from_toml_str(raw, Path::new(".")).unwrap();
        assert_eq!(reg.scan.window, 4);
        assert!(reg.scan.identifier.is_match("  sku: 'B0TEST0001',"));
        assert!(reg.entries.is_empty());
    }
}
