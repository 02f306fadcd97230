//! Fixed-width domain types shared by the transport, ledger and coordinator.
//!
//! Every enum that crosses a shared-memory boundary is `#[repr(u8)]` and is
//! decoded with a fallible `from_u8`, so a foreign writer can never smuggle an
//! invalid discriminant into Rust code.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Order side, encoded as the ASCII byte used on the wire (`'B'` / `'S'`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Side {
    Buy = b'B',
    Sell = b'S',
}

impl Side {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'B' => Some(Side::Buy),
            b'S' => Some(Side::Sell),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    #[inline(always)]
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Open/close instruction stamped on every order sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum OffsetFlag {
    /// Not yet resolved; the offset resolver fills it in
    #[default]
    Unknown = 0,
    Open = 1,
    Close = 2,
    CloseToday = 3,
    CloseYesterday = 4,
}

impl OffsetFlag {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OffsetFlag::Unknown),
            1 => Some(OffsetFlag::Open),
            2 => Some(OffsetFlag::Close),
            3 => Some(OffsetFlag::CloseToday),
            4 => Some(OffsetFlag::CloseYesterday),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_close(self) -> bool {
        matches!(
            self,
            OffsetFlag::Close | OffsetFlag::CloseToday | OffsetFlag::CloseYesterday
        )
    }
}

impl OffsetFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            OffsetFlag::Unknown => "UNKNOWN",
            OffsetFlag::Open => "OPEN",
            OffsetFlag::Close => "CLOSE",
            OffsetFlag::CloseToday => "CLOSE_TODAY",
            OffsetFlag::CloseYesterday => "CLOSE_YESTERDAY",
        }
    }
}

impl fmt::Display for OffsetFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domestic futures exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum ExchangeId {
    #[default]
    Unknown = 0,
    Shfe = 1,
    Ine = 2,
    Czce = 3,
    Dce = 4,
    Cffex = 5,
    Gfex = 6,
}

impl ExchangeId {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ExchangeId::Unknown),
            1 => Some(ExchangeId::Shfe),
            2 => Some(ExchangeId::Ine),
            3 => Some(ExchangeId::Czce),
            4 => Some(ExchangeId::Dce),
            5 => Some(ExchangeId::Cffex),
            6 => Some(ExchangeId::Gfex),
            _ => None,
        }
    }

    /// SHFE and INE require CLOSE_TODAY for positions opened in the current
    /// session; a plain CLOSE there only closes carried-over volume.
    #[inline(always)]
    pub fn distinguishes_close_today(self) -> bool {
        matches!(self, ExchangeId::Shfe | ExchangeId::Ine)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeId::Unknown => "UNKNOWN",
            ExchangeId::Shfe => "SHFE",
            ExchangeId::Ine => "INE",
            ExchangeId::Czce => "CZCE",
            ExchangeId::Dce => "DCE",
            ExchangeId::Cffex => "CFFEX",
            ExchangeId::Gfex => "GFEX",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHFE" => Ok(ExchangeId::Shfe),
            "INE" => Ok(ExchangeId::Ine),
            "CZCE" => Ok(ExchangeId::Czce),
            "DCE" => Ok(ExchangeId::Dce),
            "CFFEX" => Ok(ExchangeId::Cffex),
            "GFEX" => Ok(ExchangeId::Gfex),
            other => Err(format!("unknown exchange '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderType {
    #[default]
    Limit = 1,
    Market = 2,
}

impl OrderType {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OrderType::Limit),
            2 => Some(OrderType::Market),
            _ => None,
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimeInForce {
    /// Good for day
    #[default]
    Gfd = 1,
    /// Immediate or cancel
    Ioc = 2,
    /// Fill or kill
    Fok = 3,
}

impl TimeInForce {
    #[inline(always)]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TimeInForce::Gfd),
            2 => Some(TimeInForce::Ioc),
            3 => Some(TimeInForce::Fok),
            _ => None,
        }
    }
}

/// Maximum instrument code length, including room for a NUL terminator
pub const SYMBOL_LEN: usize = 32;

/// Instrument code stored inline as NUL-padded ASCII
///
/// `Copy` and fixed-width so it can live directly inside shared-memory
/// payloads and be used as a map key without allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Symbol([u8; SYMBOL_LEN]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("symbol is empty")]
    Empty,
    #[error("symbol '{0}' exceeds 31 bytes")]
    TooLong(String),
    #[error("symbol '{0}' is not ASCII")]
    NotAscii(String),
}

impl Symbol {
    pub const EMPTY: Symbol = Symbol([0u8; SYMBOL_LEN]);

    pub fn new(code: &str) -> Result<Self, SymbolError> {
        if code.is_empty() {
            return Err(SymbolError::Empty);
        }
        if !code.is_ascii() {
            return Err(SymbolError::NotAscii(code.to_string()));
        }
        if code.len() >= SYMBOL_LEN {
            return Err(SymbolError::TooLong(code.to_string()));
        }
        let mut bytes = [0u8; SYMBOL_LEN];
        bytes[..code.len()].copy_from_slice(code.as_bytes());
        Ok(Symbol(bytes))
    }

    /// Reinterpret raw bytes read from a foreign payload
    #[inline(always)]
    pub fn from_bytes(bytes: [u8; SYMBOL_LEN]) -> Self {
        Symbol(bytes)
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; SYMBOL_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SYMBOL_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Symbol::EMPTY
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

impl FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::new(s)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Symbol::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Correlation id linking a request to every response it produces
///
/// Allocated as `client_id * ORDER_ID_RANGE + local_seq` so ids from
/// different trader processes never collide on the shared queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Client id encoded in the high part of the id
    #[inline(always)]
    pub fn client_id(self, range: u64) -> u64 {
        self.0 / range
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static properties of a tradable instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: Symbol,
    pub exchange: ExchangeId,
    /// Minimum price increment
    pub tick_size: f64,
    /// Contract multiplier used for P&L
    pub multiplier: f64,
}

impl InstrumentSpec {
    pub fn new(symbol: Symbol, exchange: ExchangeId, tick_size: f64, multiplier: f64) -> Self {
        Self {
            symbol,
            exchange,
            tick_size,
            multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_wire_encoding() {
        assert_eq!(Side::Buy as u8, b'B');
        assert_eq!(Side::Sell as u8, b'S');
        assert_eq!(Side::from_u8(b'B'), Some(Side::Buy));
        assert_eq!(Side::from_u8(b'X'), None);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn test_offset_flag_discriminants() {
        assert_eq!(OffsetFlag::Unknown as u8, 0);
        assert_eq!(OffsetFlag::Open as u8, 1);
        assert_eq!(OffsetFlag::Close as u8, 2);
        assert_eq!(OffsetFlag::CloseToday as u8, 3);
        assert_eq!(OffsetFlag::CloseYesterday as u8, 4);
        assert_eq!(OffsetFlag::from_u8(5), None);
        assert!(OffsetFlag::CloseToday.is_close());
        assert!(!OffsetFlag::Open.is_close());
    }

    #[test]
    fn test_close_today_exchanges() {
        assert!(ExchangeId::Shfe.distinguishes_close_today());
        assert!(ExchangeId::Ine.distinguishes_close_today());
        assert!(!ExchangeId::Dce.distinguishes_close_today());
        assert!(!ExchangeId::Czce.distinguishes_close_today());
        assert!(!ExchangeId::Cffex.distinguishes_close_today());
    }

    #[test]
    fn test_exchange_parse() {
        assert_eq!("shfe".parse::<ExchangeId>(), Ok(ExchangeId::Shfe));
        assert!("NYSE".parse::<ExchangeId>().is_err());
    }

    #[test]
    fn test_symbol_roundtrip_and_limits() {
        let sym = Symbol::new("ag2506").unwrap();
        assert_eq!(sym.as_str(), "ag2506");
        assert_eq!(sym.to_string(), "ag2506");
        assert!(!sym.is_empty());

        assert_eq!(Symbol::new(""), Err(SymbolError::Empty));
        let long = "x".repeat(SYMBOL_LEN);
        assert!(matches!(Symbol::new(&long), Err(SymbolError::TooLong(_))));
        assert!(Symbol::new(&"x".repeat(SYMBOL_LEN - 1)).is_ok());
    }

    #[test]
    fn test_symbol_serde_as_string() {
        let sym = Symbol::new("rb2510").unwrap();
        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "\"rb2510\"");
        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sym);
    }

    #[test]
    fn test_correlation_id_client_part() {
        let id = CorrelationId(7 * 1_000_000 + 42);
        assert_eq!(id.client_id(1_000_000), 7);
    }
}
