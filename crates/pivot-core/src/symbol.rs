//! Pure symbol helpers.

/// Perpetual marker some alert sources append to futures symbols.
pub const PERPETUAL_SUFFIX: &str = ".P";

/// Quote currencies recognised by suffix.
const KNOWN_QUOTES: [&str; 3] = ["USDT", "USDC", "BUSD"];

/// Strip the perpetual marker: `ETHUSDT.P` -> `ETHUSDT`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .strip_suffix(PERPETUAL_SUFFIX)
        .unwrap_or(symbol)
        .to_string()
}

/// Quote currency of a symbol, used to pick the balance to check.
///
/// Unknown quotes fall back to the last four characters.
pub fn extract_quote_currency(symbol: &str) -> String {
    let symbol = normalize_symbol(symbol);
    if let Some(quote) = KNOWN_QUOTES.iter().find(|q| symbol.ends_with(*q)) {
        return (*quote).to_string();
    }
    let split = symbol.len().saturating_sub(4);
    symbol.get(split..).unwrap_or(&symbol).to_string()
}
