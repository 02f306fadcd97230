//! Order path wire types
//!
//! Both structs travel through the MWMR queues byte for byte, so they are
//! `#[repr(C)]` with explicit padding and every enum field is stored as a
//! raw `u8`. Accessors decode with `from_u8` and return `None` for values a
//! foreign writer should never have produced.

use crate::core::types::{
    CorrelationId, ExchangeId, OffsetFlag, OrderType, Side, Symbol, TimeInForce,
};
use crate::shm::ring::ShmPayload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a request asks the gateway to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestKind {
    New = 1,
    Cancel = 2,
}

impl RequestKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::New),
            2 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// What happened to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseKind {
    Ack = 1,
    Fill = 2,
    Reject = 3,
    CancelConfirm = 4,
    CancelReject = 5,
}

impl ResponseKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Ack),
            2 => Some(Self::Fill),
            3 => Some(Self::Reject),
            4 => Some(Self::CancelConfirm),
            5 => Some(Self::CancelReject),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Fill => "fill",
            Self::Reject => "reject",
            Self::CancelConfirm => "cancel_confirm",
            Self::CancelReject => "cancel_reject",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order or cancel was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RejectReason {
    #[default]
    None = 0,
    /// Refused by the exchange
    Exchange = 1,
    /// The exchange has too little position for the close
    InsufficientPosition = 2,
    /// Cancel for an order the gateway does not know or that is done
    UnknownOrder = 3,
    /// Connector could not reach the exchange
    NotConnected = 4,
    /// Malformed request
    Invalid = 5,
}

impl RejectReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Exchange),
            2 => Some(Self::InsufficientPosition),
            3 => Some(Self::UnknownOrder),
            4 => Some(Self::NotConnected),
            5 => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Exchange => "exchange",
            Self::InsufficientPosition => "insufficient_position",
            Self::UnknownOrder => "unknown_order",
            Self::NotConnected => "not_connected",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A new order or a cancel, as placed on the request queue (72 bytes)
///
/// For cancels `correlation_id` names the order to cancel.
#[derive(Clone, Copy, PartialEq)]
#[repr(C)]
pub struct OrderRequest {
    pub correlation_id: u64,
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp_ns: u64,
    pub quantity: u32,
    pub strategy_id: i32,
    pub kind: u8,
    pub side: u8,
    pub exchange: u8,
    pub order_type: u8,
    pub tif: u8,
    pub offset: u8,
    pub _pad: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<OrderRequest>() == 72);
const _: () = assert!(std::mem::align_of::<OrderRequest>() == 8);

// SAFETY: repr(C), no pointers, explicit padding, all-zero is a valid value
unsafe impl ShmPayload for OrderRequest {}

impl OrderRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new_order(
        id: CorrelationId,
        strategy_id: i32,
        symbol: Symbol,
        exchange: ExchangeId,
        side: Side,
        offset: OffsetFlag,
        quantity: u32,
        price: f64,
        order_type: OrderType,
        tif: TimeInForce,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            correlation_id: id.as_u64(),
            symbol,
            price,
            timestamp_ns,
            quantity,
            strategy_id,
            kind: RequestKind::New as u8,
            side: side as u8,
            exchange: exchange as u8,
            order_type: order_type as u8,
            tif: tif as u8,
            offset: offset as u8,
            _pad: [0; 2],
        }
    }

    pub fn cancel(id: CorrelationId, strategy_id: i32, symbol: Symbol, timestamp_ns: u64) -> Self {
        Self {
            correlation_id: id.as_u64(),
            symbol,
            price: 0.0,
            timestamp_ns,
            quantity: 0,
            strategy_id,
            kind: RequestKind::Cancel as u8,
            side: 0,
            exchange: 0,
            order_type: 0,
            tif: 0,
            offset: 0,
            _pad: [0; 2],
        }
    }

    #[inline]
    pub fn id(&self) -> CorrelationId {
        CorrelationId(self.correlation_id)
    }

    #[inline]
    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u8(self.kind)
    }

    #[inline]
    pub fn side(&self) -> Option<Side> {
        Side::from_u8(self.side)
    }

    #[inline]
    pub fn exchange(&self) -> ExchangeId {
        ExchangeId::from_u8(self.exchange).unwrap_or(ExchangeId::Unknown)
    }

    #[inline]
    pub fn offset(&self) -> OffsetFlag {
        OffsetFlag::from_u8(self.offset).unwrap_or(OffsetFlag::Unknown)
    }

    #[inline]
    pub fn order_type(&self) -> Option<OrderType> {
        OrderType::from_u8(self.order_type)
    }

    #[inline]
    pub fn tif(&self) -> Option<TimeInForce> {
        TimeInForce::from_u8(self.tif)
    }
}

impl fmt::Debug for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderRequest")
            .field("id", &self.correlation_id)
            .field("kind", &self.kind())
            .field("symbol", &self.symbol)
            .field("side", &self.side())
            .field("offset", &self.offset())
            .field("quantity", &self.quantity)
            .field("price", &self.price)
            .field("strategy_id", &self.strategy_id)
            .finish()
    }
}

/// Gateway answer to a request, as placed on the response queue (80 bytes)
///
/// `quantity` is the filled lots for a fill and the unfilled lots for a
/// reject or cancel confirm; `leaves` is what is still working afterwards.
#[derive(Clone, Copy, PartialEq)]
#[repr(C)]
pub struct OrderResponse {
    pub correlation_id: u64,
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp_ns: u64,
    pub quantity: u32,
    pub leaves: u32,
    pub strategy_id: i32,
    pub kind: u8,
    pub side: u8,
    pub offset: u8,
    pub exchange: u8,
    pub reject_reason: u8,
    pub _pad: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<OrderResponse>() == 80);
const _: () = assert!(std::mem::align_of::<OrderResponse>() == 8);

// SAFETY: repr(C), no pointers, explicit padding, all-zero is a valid value
unsafe impl ShmPayload for OrderResponse {}

impl OrderResponse {
    /// Response for `request` with quantities and price left at zero
    pub fn for_request(request: &OrderRequest, kind: ResponseKind, timestamp_ns: u64) -> Self {
        Self {
            correlation_id: request.correlation_id,
            symbol: request.symbol,
            price: request.price,
            timestamp_ns,
            quantity: 0,
            leaves: 0,
            strategy_id: request.strategy_id,
            kind: kind as u8,
            side: request.side,
            offset: request.offset,
            exchange: request.exchange,
            reject_reason: RejectReason::None as u8,
            _pad: [0; 7],
        }
    }

    #[inline]
    pub fn id(&self) -> CorrelationId {
        CorrelationId(self.correlation_id)
    }

    #[inline]
    pub fn kind(&self) -> Option<ResponseKind> {
        ResponseKind::from_u8(self.kind)
    }

    #[inline]
    pub fn side(&self) -> Option<Side> {
        Side::from_u8(self.side)
    }

    #[inline]
    pub fn offset(&self) -> OffsetFlag {
        OffsetFlag::from_u8(self.offset).unwrap_or(OffsetFlag::Unknown)
    }

    #[inline]
    pub fn reject_reason(&self) -> RejectReason {
        RejectReason::from_u8(self.reject_reason).unwrap_or(RejectReason::Invalid)
    }
}

impl fmt::Debug for OrderResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderResponse")
            .field("id", &self.correlation_id)
            .field("kind", &self.kind())
            .field("symbol", &self.symbol)
            .field("side", &self.side())
            .field("offset", &self.offset())
            .field("quantity", &self.quantity)
            .field("leaves", &self.leaves)
            .field("price", &self.price)
            .field("reject_reason", &self.reject_reason())
            .finish()
    }
}
