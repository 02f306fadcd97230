use super::connector::{ConnectorCallbacks, ExchangeConnector, ExecutionReport};
use super::types::{OrderRequest, RejectReason, RequestKind};
use crate::config::GatewayConfig;
use crate::core::types::{CorrelationId, OffsetFlag};
use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// Fill behaviour of the simulated exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedConfig {
    /// Probability that a new order is rejected instead of acknowledged
    pub reject_probability: f64,
    /// Probability that a working order trades on a given poll
    pub fill_probability: f64,
    /// Largest execution per poll (0 fills the whole remainder at once)
    pub fill_chunk: u32,
    /// RNG seed; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            reject_probability: 0.05,
            fill_probability: 1.0,
            fill_chunk: 0,
            seed: None,
        }
    }
}

impl From<&GatewayConfig> for SimulatedConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            reject_probability: config.reject_probability,
            fill_probability: config.fill_probability,
            fill_chunk: config.fill_chunk,
            seed: config.seed,
        }
    }
}

impl SimulatedConfig {
    /// Every order acknowledged and filled in full on the next poll
    pub fn instant() -> Self {
        Self {
            reject_probability: 0.0,
            fill_probability: 1.0,
            fill_chunk: 0,
            seed: Some(0),
        }
    }

    /// Orders are acknowledged and then rest until cancelled
    pub fn resting() -> Self {
        Self {
            fill_probability: 0.0,
            ..Self::instant()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimOrder {
    id: CorrelationId,
    price: f64,
    leaves: u32,
    offset: OffsetFlag,
    acked: bool,
}

/// In-process exchange that fills at the limit price
///
/// Events are produced only from [`poll`](ExchangeConnector::poll): first
/// pending cancels, then acknowledgements or rejects for new orders, then
/// executions for working orders.
pub struct SimulatedConnector {
    config: SimulatedConfig,
    rng: StdRng,
    orders: VecDeque<SimOrder>,
    cancels: VecDeque<CorrelationId>,
    known: HashSet<CorrelationId>,
    total_sent: u64,
}

impl SimulatedConnector {
    pub fn new(config: SimulatedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            reject_probability = config.reject_probability,
            fill_probability = config.fill_probability,
            fill_chunk = config.fill_chunk,
            "Initialized SimulatedConnector"
        );
        Self {
            config,
            rng,
            orders: VecDeque::new(),
            cancels: VecDeque::new(),
            known: HashSet::new(),
            total_sent: 0,
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    fn roll(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}

impl ExchangeConnector for SimulatedConnector {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn send_order(&mut self, request: &OrderRequest) -> Result<CorrelationId> {
        if request.kind() != Some(RequestKind::New) {
            return Err(anyhow!("not a new-order request: {:?}", request));
        }
        let id = request.id();
        self.orders.push_back(SimOrder {
            id,
            price: request.price,
            leaves: request.quantity,
            offset: request.offset(),
            acked: false,
        });
        self.known.insert(id);
        self.total_sent += 1;
        debug!(id = %id, quantity = request.quantity, price = request.price, "Simulated order accepted for processing");
        Ok(id)
    }

    fn cancel_order(&mut self, id: CorrelationId) -> Result<()> {
        self.cancels.push_back(id);
        Ok(())
    }

    fn poll(&mut self, callbacks: &mut dyn ConnectorCallbacks) -> usize {
        let mut delivered = 0;

        while let Some(id) = self.cancels.pop_front() {
            match self.orders.iter().position(|o| o.id == id) {
                Some(idx) => {
                    if let Some(order) = self.orders.remove(idx) {
                        callbacks.on_cancel(id, order.leaves);
                    }
                }
                None => {
                    let reason = if self.known.contains(&id) {
                        // Already done
                        RejectReason::UnknownOrder
                    } else {
                        RejectReason::Invalid
                    };
                    callbacks.on_cancel_reject(id, reason);
                }
            }
            delivered += 1;
        }

        let mut idx = 0;
        while idx < self.orders.len() {
            let mut order = self.orders[idx];

            if !order.acked {
                if self.roll(self.config.reject_probability) {
                    callbacks.on_reject(order.id, RejectReason::Exchange, order.leaves);
                    self.orders.remove(idx);
                    delivered += 1;
                    continue;
                }
                callbacks.on_order_ack(order.id);
                order.acked = true;
                delivered += 1;
            }

            if order.leaves > 0 && self.roll(self.config.fill_probability) {
                let chunk = match self.config.fill_chunk {
                    0 => order.leaves,
                    n => n.min(order.leaves),
                };
                order.leaves -= chunk;
                callbacks.on_fill(&ExecutionReport {
                    id: order.id,
                    quantity: chunk,
                    price: order.price,
                    leaves: order.leaves,
                    offset: order.offset,
                });
                delivered += 1;
            }

            if order.leaves == 0 {
                self.orders.remove(idx);
            } else {
                self.orders[idx] = order;
                idx += 1;
            }
        }
        delivered
    }

    fn working_orders(&self) -> usize {
        self.orders.len()
    }
}
