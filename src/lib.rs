mod settings;

pub use settings::*;

pub mod comb;
pub mod config;
pub mod geometry;
pub mod grid;
pub mod inset_order;
pub mod merge;
pub mod order;
pub mod plan;
pub mod pool;

mod error;
mod path;

pub use comb::{Comb, CombPath, CombPaths, LinePolygonsCrossings};
pub use config::{GCodePathConfig, PathConfigStorage, PrintFeatureType, SpeedDerivatives};
pub use error::PlannerError;
pub use geometry::{Point2, Polygon, PolygonSet};
pub use order::PathOrderOptimizer;
pub use path::{
    ExtrusionJunction, ExtrusionLine, GCodePath, SpaceFillType, TimeMaterialEstimates,
};
pub use plan::{ExtruderPlan, LayerPlan, LayerSetup, NozzleTempInsert};
pub use pool::{parallel_for, run_multiple_producers_ordered_consumer, ThreadPool};

use log::info;

///The handle threaded through the planning APIs: it owns the worker pool
///used to plan independent layers in parallel. Dropping the context joins
///the pool.
pub struct SliceContext {
    pool: ThreadPool,
}

impl SliceContext {
    ///A context with a pool sized to the hardware concurrency.
    pub fn new() -> Self {
        let pool = ThreadPool::with_hardware_concurrency();
        info!("planning with {} worker threads", pool.thread_count() + 1);
        SliceContext { pool }
    }

    ///A context with an explicit worker thread count, mostly for tests.
    pub fn with_threads(nthreads: usize) -> Self {
        SliceContext {
            pool: ThreadPool::new(nthreads),
        }
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    ///Build the layers of `first..last` in parallel and hand every result
    ///to `consume` in strictly increasing layer order. Within a single
    ///layer, planning stays single threaded.
    pub fn plan_layers<T, B, C>(&self, first: usize, last: usize, build: B, consume: C)
    where
        T: Send,
        B: Fn(usize) -> T + Sync,
        C: FnMut(T) + Send,
    {
        const MAX_PENDING_PER_WORKER: usize = 8;
        run_multiple_producers_ordered_consumer(
            &self.pool,
            first,
            last,
            build,
            consume,
            MAX_PENDING_PER_WORKER,
        );
    }
}

impl Default for SliceContext {
    fn default() -> Self {
        SliceContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_are_consumed_in_order() {
        let context = SliceContext::with_threads(3);
        let mut consumed = Vec::new();
        context.plan_layers(
            0,
            64,
            |layer_nr| layer_nr * 10,
            |result| consumed.push(result),
        );
        let expected: Vec<usize> = (0..64).map(|i| i * 10).collect();
        assert_eq!(consumed, expected);
    }
}
