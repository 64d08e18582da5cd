//! Canonical <-> exchange symbol, asset and timeframe spellings

use meridian_core::{ExchangeId, Symbol, Timeframe};

/// Exchange spelling of an asset code
pub fn venue_asset(exchange: ExchangeId, asset: &str) -> String {
    let asset = asset.to_ascii_uppercase();
    match (exchange, asset.as_str()) {
        (ExchangeId::Kraken, "BTC") => "XBT".to_string(),
        (ExchangeId::Kraken, "DOGE") => "XDG".to_string(),
        _ => asset,
    }
}

/// Canonical spelling of an exchange asset code
///
/// Kraken prefixes legacy assets with `X` (crypto) or `Z` (fiat) and calls
/// bitcoin `XBT`: `XXBT` -> `BTC`, `ZUSD` -> `USD`, `XDG` -> `DOGE`.
pub fn canonical_asset(exchange: ExchangeId, raw: &str) -> String {
    let raw = raw.trim().to_ascii_uppercase();
    if exchange != ExchangeId::Kraken {
        return raw;
    }
    // Staking / hold variants such as `ETH.F` or `USD.HOLD` count as the base asset
    let raw = raw.split('.').next().unwrap_or_default().to_string();
    let stripped = if raw.len() == 4 && (raw.starts_with('X') || raw.starts_with('Z')) {
        raw[1..].to_string()
    } else {
        raw
    };
    match stripped.as_str() {
        "XBT" => "BTC".to_string(),
        "XDG" => "DOGE".to_string(),
        _ => stripped,
    }
}

/// Exchange spelling of a trading pair
pub fn venue_symbol(exchange: ExchangeId, symbol: &Symbol) -> String {
    let base = venue_asset(exchange, symbol.base());
    let quote = venue_asset(exchange, symbol.quote());
    match exchange {
        ExchangeId::Kraken | ExchangeId::Binance => format!("{base}{quote}"),
        ExchangeId::Coinbase | ExchangeId::Okx => format!("{base}-{quote}"),
    }
}

/// Exchange parameter for a candle timeframe
pub fn venue_timeframe(exchange: ExchangeId, timeframe: Timeframe) -> String {
    match exchange {
        // Kraken takes the interval in minutes
        ExchangeId::Kraken => timeframe.minutes().to_string(),
        ExchangeId::Coinbase => match timeframe {
            Timeframe::OneMinute => "ONE_MINUTE",
            Timeframe::FiveMinutes => "FIVE_MINUTE",
            Timeframe::FifteenMinutes => "FIFTEEN_MINUTE",
            Timeframe::OneHour => "ONE_HOUR",
            Timeframe::FourHours => "SIX_HOUR",
            Timeframe::OneDay => "ONE_DAY",
        }
        .to_string(),
        ExchangeId::Binance => match timeframe {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        }
        .to_string(),
        ExchangeId::Okx => match timeframe {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1H",
            Timeframe::FourHours => "4H",
            Timeframe::OneDay => "1D",
        }
        .to_string(),
    }
}
