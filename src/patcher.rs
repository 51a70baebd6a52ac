//! Line-window price patcher for static template files.
//!
//! A product block looks like
//!
//! ```text
//!   asin: 'B0TEST0001',
//!   title: 'Some product',
//!   price: '100€',
//! ```
//!
//! The price line must follow its identifier line within `window` lines and
//! before any other identifier line. Only the text between the price quotes is
//! ever rewritten.
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::market::{Currency, SymbolPlacement};

pub const DEFAULT_SCAN_WINDOW: usize = 10;

/// `asin`, `ASIN`, `amazonAsin`, `productASIN`, `amazon_asin`; not `basin`.
const DEFAULT_IDENTIFIER_PATTERN: &str = r#"\b(?:[a-z][A-Za-z0-9]*A|[a-z][a-z0-9_]*_a|a|A)(?:sin|SIN)\s*:\s*(?:'([A-Z0-9]{10})'|"([A-Z0-9]{10})"|`([A-Z0-9]{10})`)"#;
const DEFAULT_PRICE_PATTERN: &str = r#"\bprice\s*:\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)"#;

/// The two line shapes and the lookahead bound the scan relies on.
#[derive(Debug, Clone)]
pub struct ScanRules {
    /// Should capture the declared code; without a group any occurrence on the line counts.
    pub identifier: Regex,
    /// Must capture the quoted value; the first participating group wins.
    pub price: Regex,
    pub window: usize,
}

impl Default for ScanRules {
    fn default() -> Self {
        Self {
            identifier: Regex::new(DEFAULT_IDENTIFIER_PATTERN).expect("identifier pattern"),
            price: Regex::new(DEFAULT_PRICE_PATTERN).expect("price pattern"),
            window: DEFAULT_SCAN_WINDOW,
        }
    }
}

/// Where an identifier occurrence led the scan.
#[derive(Debug, Clone, PartialEq)]
pub enum Located {
    /// Price field found; `value` is the byte range of the quoted text on `price_line`.
    Price {
        id_line: usize,
        price_line: usize,
        value: Range<usize>,
    },
    /// Window exhausted or interrupted by another identifier line.
    NoPriceField { id_line: usize },
}

impl ScanRules {
    pub fn is_identifier_line(&self, line: &str) -> bool {
        self.identifier.is_match(line)
    }

    /// Whether `line` is an identifier line declaring `asin`.
    pub fn declares(&self, line: &str, asin: &str) -> bool {
        let Some(caps) = self.identifier.captures(line) else {
            return false;
        };
        if self.identifier.captures_len() < 2 {
            return line.contains(asin);
        }
        (1..caps.len())
            .find_map(|i| caps.get(i))
            .is_some_and(|m| m.as_str() == asin)
    }

    /// Byte range of the quoted price value, if `line` declares a price.
    pub fn price_value(&self, line: &str) -> Option<Range<usize>> {
        let caps = self.price.captures(line)?;
        (1..caps.len())
            .find_map(|i| caps.get(i))
            .map(|m| m.range())
    }

    /// Walk `lines` and report every block declaring `asin`. Line indices are 0-based.
    pub fn locate<S: AsRef<str>>(&self, lines: &[S], asin: &str) -> Vec<Located> {
        let mut out = Vec::new();
        let last = lines.len().saturating_sub(1);
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i].as_ref();
            if !self.declares(line, asin) {
                i += 1;
                continue;
            }

            let end = (i + self.window).min(last);
            let mut next = i + 1;
            let mut found = None;
            for j in (i + 1)..=end {
                let candidate = lines[j].as_ref();
                if self.is_identifier_line(candidate) {
                    next = j;
                    break;
                }
                if let Some(value) = self.price_value(candidate) {
                    found = Some(Located::Price {
                        id_line: i,
                        price_line: j,
                        value,
                    });
                    next = j + 1;
                    break;
                }
            }
            out.push(found.unwrap_or(Located::NoPriceField { id_line: i }));
            i = next;
        }
        out
    }
}

/// Strip everything but digits and the decimal point; non-positive values do not count.
pub fn parse_recorded_price(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value = digits.parse::<f64>().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

pub fn change_percent(old: f64, new: f64) -> f64 {
    (new - old).abs() / old * 100.0
}

/// True when `old` and `new` differ by a factor of ten or more, which usually
/// means a thousands separator was read as a decimal point (`1.299€`).
pub fn magnitude_mismatch(old: f64, new: f64) -> bool {
    old > 0.0 && new > 0.0 && (new / old >= 10.0 || old / new >= 10.0)
}

/// Render `new` rounded to whole units, keeping the symbol where `old_raw` had it.
pub fn render_price(old_raw: &str, new: f64, currency: Currency) -> String {
    let amount = new.round() as i64;
    let trimmed = old_raw.trim();
    let placement = if trimmed.starts_with(currency.symbol) {
        SymbolPlacement::Prefix
    } else if trimmed.ends_with(currency.symbol) {
        SymbolPlacement::Suffix
    } else {
        currency.placement
    };
    let spaced = match placement {
        SymbolPlacement::Prefix => trimmed.starts_with(&format!("{} ", currency.symbol)),
        SymbolPlacement::Suffix => trimmed.ends_with(&format!(" {}", currency.symbol)),
    };
    if !spaced {
        return currency.format_with(amount, placement);
    }
    match placement {
        SymbolPlacement::Prefix => format!("{} {}", currency.symbol, amount),
        SymbolPlacement::Suffix => format!("{} {}", amount, currency.symbol),
    }
}

/// Result of evaluating one identifier occurrence. Lines are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FieldOutcome {
    Updated {
        line: usize,
        old: String,
        new: String,
        change_percent: f64,
    },
    BelowThreshold {
        line: usize,
        old: f64,
        change_percent: f64,
    },
    /// Over the threshold but rounds to the text already there.
    Current { line: usize },
    Unparsable { line: usize, raw: String },
    NoPriceField { line: usize },
}

#[derive(Debug, Clone)]
pub struct PatchResult {
    pub text: String,
    pub fields: Vec<FieldOutcome>,
}

impl PatchResult {
    pub fn changed(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f, FieldOutcome::Updated { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Updated,
    Unchanged,
    /// File exists but never declares the identifier.
    IdentifierNotFound,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilePatch {
    pub path: PathBuf,
    pub status: FileStatus,
    pub fields: Vec<FieldOutcome>,
}

/// A price currently recorded in a template, as reported by [`Patcher::recorded_prices`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrice {
    pub line: usize,
    pub raw: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Patcher {
    pub rules: ScanRules,
    pub threshold_percent: f64,
    pub dry_run: bool,
}

impl Patcher {
    pub fn new(rules: ScanRules, threshold_percent: f64) -> Self {
        Self {
            rules,
            threshold_percent,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Apply `new_price` to every block declaring `asin` in `text`. Pure.
    pub fn patch_text(&self, text: &str, asin: &str, new_price: f64, currency: Currency) -> PatchResult {
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let mut fields = Vec::new();

        for located in self.rules.locate(&lines, asin) {
            let (price_line, value) = match located {
                Located::NoPriceField { id_line } => {
                    debug!(asin, line = id_line + 1, "no price field in window");
                    fields.push(FieldOutcome::NoPriceField { line: id_line + 1 });
                    continue;
                }
                Located::Price {
                    price_line, value, ..
                } => (price_line, value),
            };

            let line_no = price_line + 1;
            let raw = lines[price_line][value.clone()].to_string();
            let Some(old) = parse_recorded_price(&raw) else {
                debug!(asin, line = line_no, raw = %raw, "recorded price not numeric");
                fields.push(FieldOutcome::Unparsable { line: line_no, raw });
                continue;
            };

            if magnitude_mismatch(old, new_price) {
                warn!(
                    asin,
                    line = line_no,
                    raw = %raw,
                    old,
                    new = new_price,
                    "recorded price is an order of magnitude off; check the field format"
                );
            }
            let pct = change_percent(old, new_price);
            if pct < self.threshold_percent {
                debug!(asin, line = line_no, old, new = new_price, change_pct = pct, "below threshold");
                fields.push(FieldOutcome::BelowThreshold {
                    line: line_no,
                    old,
                    change_percent: pct,
                });
                continue;
            }

            let rendered = render_price(&raw, new_price, currency);
            if rendered == raw {
                fields.push(FieldOutcome::Current { line: line_no });
                continue;
            }
            lines[price_line].replace_range(value, &rendered);
            fields.push(FieldOutcome::Updated {
                line: line_no,
                old: raw,
                new: rendered,
                change_percent: pct,
            });
        }

        PatchResult {
            text: lines.join("\n"),
            fields,
        }
    }

    /// Patch one template in place. The file is only written when a field changed
    /// (and never in dry-run mode).
    pub fn patch_file(
        &self,
        path: &Path,
        asin: &str,
        new_price: f64,
        currency: Currency,
    ) -> Result<FilePatch> {
        if !path.exists() {
            warn!(path = %path.display(), asin, "template file missing; skipping");
            return Ok(FilePatch {
                path: path.to_path_buf(),
                status: FileStatus::Missing,
                fields: Vec::new(),
            });
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("read template {}", path.display()))?;
        let result = self.patch_text(&text, asin, new_price, currency);

        let status = if result.changed() {
            if !self.dry_run {
                fs::write(path, &result.text)
                    .with_context(|| format!("write template {}", path.display()))?;
            }
            FileStatus::Updated
        } else if result.fields.is_empty() {
            FileStatus::IdentifierNotFound
        } else {
            FileStatus::Unchanged
        };

        Ok(FilePatch {
            path: path.to_path_buf(),
            status,
            fields: result.fields,
        })
    }

    /// Recorded price fields for `asin` in `path`; `None` when the file is missing.
    pub fn recorded_prices(&self, path: &Path, asin: &str) -> Result<Option<Vec<RecordedPrice>>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("read template {}", path.display()))?;
        let lines: Vec<&str> = text.split('\n').collect();
        let found = self
            .rules
            .locate(&lines, asin)
            .into_iter()
            .filter_map(|l| match l {
                Located::Price {
                    price_line, value, ..
                } => {
                    let raw = lines[price_line][value].to_string();
                    Some(RecordedPrice {
                        line: price_line + 1,
                        value: parse_recorded_price(&raw),
                        raw,
                    })
                }
                Located::NoPriceField { .. } => None,
            })
            .collect();
        Ok(Some(found))
    }
}
