use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// A base-asset identifier, e.g. `"BTC"`.
///
/// Equality and hashing are defined on the *normalized* form, so two
/// [`Symbol`]s constructed from differently-cased or suffixed user input
/// compare equal once normalized.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Symbol(SmolStr);

/// Quote suffixes and separators stripped during normalization, longest
/// first so `"1000PEPE"`-style prefixes aren't mistaken for a suffix match.
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD", "PERP", "SWAP"];
const SEPARATORS: &[char] = ['-', '_', '/', ':'];

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(SmolStr::new(normalize(raw.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol::new(value)
    }
}

/// Canonicalize a user- or exchange-supplied symbol string: uppercase, strip
/// separators, strip one trailing quote suffix.
///
/// Invariant: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let upper: String = raw
        .chars()
        .filter(|c| !SEPARATORS.contains(c))
        .flat_map(|c| c.to_uppercase())
        .collect();

    for suffix in QUOTE_SUFFIXES {
        if let Some(stripped) = upper.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }

    upper
}

/// Append-only symbol interner mapping [`Symbol`] to a compact `u16` index,
/// used by [`CompactLiquidation`](crate::model::liquidation::CompactLiquidation)
/// records. Readers never block writers for long: a single `RwLock` guards
/// an `IndexMap` whose entries are never removed or reassigned.
#[derive(Debug, Default)]
pub struct SymbolTable {
    inner: RwLock<IndexMap<Symbol, u16>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a [`Symbol`]'s interned index without inserting it.
    pub fn get(&self, symbol: &Symbol) -> Option<u16> {
        self.inner.read().get(symbol).copied()
    }

    /// Resolve a [`Symbol`] to its interned index, inserting it if unseen.
    pub fn intern(&self, symbol: &Symbol) -> u16 {
        if let Some(id) = self.inner.read().get(symbol) {
            return *id;
        }

        let mut guard = self.inner.write();
        if let Some(id) = guard.get(symbol) {
            return *id;
        }
        let id = guard.len() as u16;
        guard.insert(symbol.clone(), id);
        id
    }

    /// Reverse lookup: recover the [`Symbol`] for an interned index.
    pub fn resolve(&self, id: u16) -> Option<Symbol> {
        self.inner
            .read()
            .get_index(id as usize)
            .map(|(symbol, _)| symbol.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_separators_and_quote_suffix() {
        assert_eq!(normalize("btc-usdt"), "BTC");
        assert_eq!(normalize("BTC_USDT"), "BTC");
        assert_eq!(normalize("BTC/USD"), "BTC");
        assert_eq!(normalize("ethUSDC"), "ETH");
        assert_eq!(normalize("SOL"), "SOL");
    }

    #[test]
    fn normalization_is_idempotent() {
        let cases = ["btc-usdt", "ETH_USDC", "sol", "1000PEPEUSDT"];
        for raw in cases {
            let once = normalize(raw);
            let twice = normalize(&once);
            assert_eq!(once, twice, "normalize not idempotent for {raw}");
        }
    }

    #[test]
    fn differently_formatted_inputs_denote_equal_symbols() {
        assert_eq!(Symbol::new("btc-usdt"), Symbol::new("BTCUSDT"));
        assert_eq!(Symbol::new("BTC/USD"), Symbol::new("btc_usd"));
    }

    #[test]
    fn symbol_table_interns_once_and_resolves_back() {
        let table = SymbolTable::new();
        let btc = Symbol::new("BTC");
        let eth = Symbol::new("ETH");

        let btc_id = table.intern(&btc);
        let eth_id = table.intern(&eth);
        let btc_id_again = table.intern(&btc);

        assert_eq!(btc_id, btc_id_again);
        assert_ne!(btc_id, eth_id);
        assert_eq!(table.resolve(btc_id), Some(btc));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn get_does_not_insert_unseen_symbols() {
        let table = SymbolTable::new();
        assert_eq!(table.get(&Symbol::new("BTC")), None);
        assert_eq!(table.len(), 0);

        let id = table.intern(&Symbol::new("BTC"));
        assert_eq!(table.get(&Symbol::new("BTC")), Some(id));
    }
}
