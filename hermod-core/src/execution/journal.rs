use crate::core::errors::TransportGap;
use crate::core::types::{OffsetFlag, Side, Symbol};
use crate::execution::types::{OrderRequest, OrderResponse, RejectReason, RequestKind, ResponseKind};
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{error, info};

/// Events buffered between the order path and the writer thread
const JOURNAL_BUFFER: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: u64,
    pub kind: Option<RequestKind>,
    pub strategy_id: i32,
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub offset: OffsetFlag,
    pub quantity: u32,
    pub price: f64,
}

impl From<&OrderRequest> for RequestRecord {
    fn from(req: &OrderRequest) -> Self {
        Self {
            id: req.correlation_id,
            kind: req.kind(),
            strategy_id: req.strategy_id,
            symbol: req.symbol,
            side: req.side(),
            offset: req.offset(),
            quantity: req.quantity,
            price: req.price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: u64,
    pub kind: Option<ResponseKind>,
    pub symbol: Symbol,
    pub quantity: u32,
    pub leaves: u32,
    pub price: f64,
    pub reject_reason: RejectReason,
}

impl From<&OrderResponse> for ResponseRecord {
    fn from(resp: &OrderResponse) -> Self {
        Self {
            id: resp.correlation_id,
            kind: resp.kind(),
            symbol: resp.symbol,
            quantity: resp.quantity,
            leaves: resp.leaves,
            price: resp.price,
            reject_reason: resp.reject_reason(),
        }
    }
}

/// Journal event for audit and post-mortem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum JournalEvent {
    Request(RequestRecord),
    Response(ResponseRecord),
    Gap {
        queue: String,
        expected: u64,
        found: u64,
        missed: u64,
    },
}

impl From<&TransportGap> for JournalEvent {
    fn from(gap: &TransportGap) -> Self {
        JournalEvent::Gap {
            queue: gap.queue.to_string(),
            expected: gap.expected,
            found: gap.found,
            missed: gap.missed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: JournalEvent,
}

impl JournalEntry {
    pub fn new(event: JournalEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis() as u64;

        Self { timestamp, event }
    }
}

/// JSONL journal written from a background thread
///
/// `record` never blocks; when the buffer is full the event is dropped and
/// logged.
pub struct AsyncJournal {
    sender: Option<Sender<JournalEvent>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl AsyncJournal {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create journal directory {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal file {}", path.display()))?;

        let (sender, receiver) = bounded(JOURNAL_BUFFER);
        let handle = thread::Builder::new()
            .name("hermod-journal".into())
            .spawn(move || Self::writer_loop(file, receiver))
            .context("Failed to spawn journal thread")?;

        info!(path = %path.display(), "Order journal opened");
        Ok(Self {
            sender: Some(sender),
            thread_handle: Some(handle),
        })
    }

    fn writer_loop(file: std::fs::File, receiver: Receiver<JournalEvent>) {
        let mut out = BufWriter::new(file);

        for event in receiver {
            let entry = JournalEntry::new(event);
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(out, "{}", json) {
                        error!("Failed to write to journal: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize journal entry: {}", e);
                }
            }
        }

        if let Err(e) = out.flush() {
            error!("Failed to flush journal: {}", e);
        }
        info!("AsyncJournal writer thread stopping");
    }

    pub fn record(&self, event: JournalEvent) {
        if let Some(sender) = &self.sender {
            if let Err(e) = sender.try_send(event) {
                error!("AsyncJournal buffer full or disconnected, dropping event: {:?}", e);
            }
        }
    }

    pub fn record_request(&self, request: &OrderRequest) {
        self.record(JournalEvent::Request(request.into()));
    }

    pub fn record_response(&self, response: &OrderResponse) {
        self.record(JournalEvent::Response(response.into()));
    }
}

impl Drop for AsyncJournal {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop
        let _ = self.sender.take();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CorrelationId, ExchangeId, OrderType, TimeInForce};
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use tempfile::NamedTempFile;

    fn request() -> OrderRequest {
        OrderRequest::new_order(
            CorrelationId(2_000_001),
            3,
            Symbol::new("m2509").unwrap(),
            ExchangeId::Dce,
            Side::Buy,
            OffsetFlag::Open,
            2,
            3_100.0,
            OrderType::Limit,
            TimeInForce::Gfd,
            0,
        )
    }

    #[test]
    fn test_async_journal_writes() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        {
            let journal = AsyncJournal::new(path.clone()).unwrap();
            let req = request();
            journal.record_request(&req);
            let mut fill = OrderResponse::for_request(&req, ResponseKind::Fill, 5);
            fill.quantity = 2;
            journal.record_response(&fill);
            journal.record((&TransportGap::new("order_request", 4, 9, 5)).into());
        }

        let reader = BufReader::new(File::open(&path).unwrap());
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>().unwrap();
        assert_eq!(lines.len(), 3);

        let entry: JournalEntry = serde_json::from_str(&lines[0]).unwrap();
        match entry.event {
            JournalEvent::Request(r) => {
                assert_eq!(r.id, 2_000_001);
                assert_eq!(r.kind, Some(RequestKind::New));
                assert_eq!(r.symbol.as_str(), "m2509");
            }
            other => panic!("Wrong event type: {:?}", other),
        }

        let entry: JournalEntry = serde_json::from_str(&lines[1]).unwrap();
        assert!(matches!(
            entry.event,
            JournalEvent::Response(ResponseRecord { quantity: 2, kind: Some(ResponseKind::Fill), .. })
        ));

        let entry: JournalEntry = serde_json::from_str(&lines[2]).unwrap();
        assert!(matches!(entry.event, JournalEvent::Gap { missed: 5, .. }));
    }
}
