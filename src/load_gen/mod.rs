//! Load generators: lazy, ordered, non-restartable query sequences.
//!
//! - [`ServerLoadGen`]: open loop, issues on a schedule regardless of completions
//! - [`SingleStreamLoadGen`]: closed loop, issues the next query once the previous one completed
//!
//! Both stop once `min_query_count` queries were issued AND `min_duration_ms` elapsed
//! since the first issue.

pub mod server;
pub mod single_stream;

pub use server::{Arrival, ServerLoadGen};
pub use single_stream::SingleStreamLoadGen;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::perf_result::PerfResult;
use crate::query::{Query, QueryId};

/// A query scheduling policy
pub trait LoadGen {
    type Payload;

    /// Produce the next query, blocking as the policy requires; `None` once done
    fn next_query(&mut self) -> Option<Query<Self::Payload>>;

    /// Queries issued so far
    fn count_issued(&self) -> u64;

    /// Issued queries per second of wall time since the first issue
    fn get_issued_qps(&self) -> f64;

    /// Iterate the remaining queries
    fn queries(&mut self) -> Queries<'_, Self>
    where
        Self: Sized,
    {
        Queries { gen: self }
    }
}

/// Iterator over a load generator's remaining queries
pub struct Queries<'a, G> {
    gen: &'a mut G,
}

impl<G: LoadGen> Iterator for Queries<'_, G> {
    type Item = Query<G::Payload>;

    fn next(&mut self) -> Option<Self::Item> {
        self.gen.next_query()
    }
}

impl<G: LoadGen> std::iter::FusedIterator for Queries<'_, G> {}

/// Uniform sampler over a fixed payload set
pub struct PayloadPool<P> {
    items: Arc<[P]>,
    rng: StdRng,
}

impl<P: Clone> PayloadPool<P> {
    pub fn new(items: Arc<[P]>, seed: Option<u64>) -> Self {
        Self {
            items,
            rng: seeded_rng(seed),
        }
    }

    /// A random payload, or `None` when the set is empty
    pub fn sample(&mut self) -> Option<P> {
        if self.items.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.items.len());
        Some(self.items[idx].clone())
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Issue bookkeeping shared by both policies
pub(crate) struct Issuer {
    result: Arc<PerfResult>,
    min_query_count: u64,
    min_duration: Duration,
    next_id: QueryId,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Issuer {
    pub(crate) fn new(result: Arc<PerfResult>, min_query_count: u64, min_duration_ms: u64) -> Self {
        Self {
            result,
            min_query_count,
            min_duration: Duration::from_millis(min_duration_ms),
            next_id: 0,
            start: None,
            end: None,
        }
    }

    pub(crate) fn result(&self) -> &PerfResult {
        &self.result
    }

    pub(crate) fn is_done(&self) -> bool {
        self.end.is_some()
    }

    /// Start of the run, fixed by the first call to [`Issuer::issue`]
    pub(crate) fn start(&mut self, now: Instant) -> Instant {
        *self.start.get_or_insert(now)
    }

    /// Mark the sequence finished without issuing
    pub(crate) fn finish(&mut self, now: Instant) {
        if self.end.is_none() {
            self.end = Some(now);
        }
    }

    /// Assign the next id and register it with the ledger, unless both stop
    /// conditions are already met
    pub(crate) fn issue(&mut self, now: Instant) -> Option<QueryId> {
        if self.is_done() {
            return None;
        }
        let start = self.start(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.min_duration && self.count_issued() >= self.min_query_count {
            self.finish(now);
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.result.add_query(id, now);
        Some(id)
    }

    pub(crate) fn count_issued(&self) -> u64 {
        self.next_id as u64
    }

    pub(crate) fn min_query_count(&self) -> u64 {
        self.min_query_count
    }

    /// Whether a query scheduled at `offset` from the start would find both stop
    /// conditions already met
    pub(crate) fn satisfied_at(&self, offset: Duration) -> bool {
        self.count_issued() >= self.min_query_count && offset >= self.min_duration
    }

    pub(crate) fn issued_qps(&self) -> f64 {
        let Some(start) = self.start else {
            return 0.0;
        };
        let end = self.end.unwrap_or_else(Instant::now);
        let elapsed = end.saturating_duration_since(start).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.count_issued() as f64 / elapsed
    }
}
