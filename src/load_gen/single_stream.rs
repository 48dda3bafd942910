//! Closed-loop load generator.

use std::sync::Arc;
use std::time::Instant;

use super::{Issuer, LoadGen, PayloadPool};
use crate::perf_result::PerfResult;
use crate::query::{Query, QueryId};

/// Issues one query at a time: the next id goes out only after the previous one
/// has an outcome in the ledger, so at most one query is ever in flight.
pub struct SingleStreamLoadGen<P> {
    issuer: Issuer,
    in_flight: Option<QueryId>,
    payloads: Option<PayloadPool<P>>,
}

impl<P: Clone> SingleStreamLoadGen<P> {
    pub fn new(result: Arc<PerfResult>, min_query_count: u64, min_duration_ms: u64) -> Self {
        Self {
            issuer: Issuer::new(result, min_query_count, min_duration_ms),
            in_flight: None,
            payloads: None,
        }
    }

    pub fn with_payloads(mut self, payloads: PayloadPool<P>) -> Self {
        self.payloads = Some(payloads);
        self
    }
}

impl<P: Clone> LoadGen for SingleStreamLoadGen<P> {
    type Payload = P;

    fn next_query(&mut self) -> Option<Query<P>> {
        if self.issuer.is_done() {
            return None;
        }
        if let Some(prev) = self.in_flight.take() {
            if !self.issuer.result().wait_for_completion(prev) {
                tracing::warn!("Query {} never completed; ending single-stream run", prev);
                self.issuer.finish(Instant::now());
                return None;
            }
        }

        let now = Instant::now();
        let id = self.issuer.issue(now)?;
        self.in_flight = Some(id);

        let mut query = Query::new(id, now);
        if let Some(payload) = self.payloads.as_mut().and_then(PayloadPool::sample) {
            query = query.with_payload(payload);
        }
        Some(query)
    }

    fn count_issued(&self) -> u64 {
        self.issuer.count_issued()
    }

    fn get_issued_qps(&self) -> f64 {
        self.issuer.issued_qps()
    }
}
