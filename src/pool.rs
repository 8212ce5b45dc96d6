use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolQueue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    condition: Condvar,
}

///Very minimal and low level thread pool: a synchronized FIFO queue shared
///by a fleet of worker threads. Consider using [`parallel_for`] instead;
///interfacing directly with this type should be reserved to concurrency
///primitives.
///
///The calling thread of the primitives is a worker too: it executes queued
///tasks until its own submission completes. Workers suspend on the queue's
///condition variable when there is nothing to run.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    ///Spawns a pool with `nthreads` worker threads. With zero threads every
    ///task runs on the submitting thread.
    pub fn new(nthreads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            condition: Condvar::new(),
        });
        let threads = (0..nthreads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::worker(&shared))
            })
            .collect();
        ThreadPool { shared, threads }
    }

    ///A pool sized to the hardware concurrency, minus the main thread which
    ///participates as a worker as well.
    pub fn with_hardware_concurrency() -> Self {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ThreadPool::new(hardware.saturating_sub(1))
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn worker(shared: &PoolShared) {
        let mut queue = shared.queue.lock();
        loop {
            if let Some(task) = queue.tasks.pop_front() {
                drop(queue);
                task();
                queue = shared.queue.lock();
            } else if queue.shutdown {
                return;
            } else {
                shared.condition.wait(&mut queue);
            }
        }
    }

    pub fn push(&self, task: Task) {
        self.shared.queue.lock().tasks.push_back(task);
        self.shared.condition.notify_one();
    }

    ///Push a task whose captures live shorter than 'static.
    ///
    ///Safety: the caller must not return until the task has finished
    ///executing; every primitive below waits on a completion signal before
    ///returning, which keeps the borrows alive for the task's duration.
    unsafe fn push_erased<'env>(&self, task: Box<dyn FnOnce() + Send + 'env>) {
        let task: Task = std::mem::transmute(task);
        self.push(task);
    }

    ///Execute queued tasks on the calling thread while the predicate holds.
    ///Does not wait: returns as soon as the queue runs empty.
    pub fn work_while(&self, predicate: impl Fn() -> bool) {
        while predicate() {
            let task = self.shared.queue.lock().tasks.pop_front();
            match task {
                Some(task) => task(),
                None => return,
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.condition.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

struct ParallelForState {
    chunks_remaining: Mutex<usize>,
    work_done: Condvar,
}

///Run `body` for every index of `range`, partitioned into at most
///`chunks_per_worker * workers` chunks of at least `chunk_size_factor`
///items. The calling thread participates by executing queued work until all
///chunks complete. Ordering between chunks is not guaranteed; the body must
///be free of observable cross-chunk side effects.
pub fn parallel_for<F>(
    pool: &ThreadPool,
    range: std::ops::Range<usize>,
    body: F,
    chunk_size_factor: usize,
    chunks_per_worker: usize,
) where
    F: Fn(usize) + Sync,
{
    let nitems = range.len();
    if nitems == 0 {
        return;
    }
    let nworkers = pool.thread_count() + 1; // the main thread is a worker too
    let chunk_size_factor = chunk_size_factor.max(1);
    let blocks = nitems.div_ceil(chunk_size_factor);
    let max_chunks = (chunks_per_worker.max(1) * nworkers).min(blocks);
    let chunk_size = chunk_size_factor * blocks.div_ceil(max_chunks);
    let chunks = nitems.div_ceil(chunk_size);

    // The state lives on this stack frame; the completion wait below plus
    // the mutex hand-over on the last decrement keep it alive for every
    // task. Tasks capture only references, so their teardown touches
    // nothing of the caller.
    let state = ParallelForState {
        chunks_remaining: Mutex::new(chunks),
        work_done: Condvar::new(),
    };
    let state_ref = &state;
    let body_ref: &(dyn Fn(usize) + Sync) = &body;

    let mut chunk_first = range.start;
    while chunk_first < range.end {
        let chunk_last = (chunk_first + chunk_size).min(range.end);
        let task = Box::new(move || {
            for i in chunk_first..chunk_last {
                body_ref(i);
            }
            let mut remaining = state_ref.chunks_remaining.lock();
            *remaining -= 1;
            if *remaining == 0 {
                state_ref.work_done.notify_all();
            }
        });
        unsafe { pool.push_erased(task) };
        chunk_first = chunk_last;
    }

    pool.work_while(|| *state.chunks_remaining.lock() > 0);
    let mut remaining = state.chunks_remaining.lock();
    while *remaining > 0 {
        state.work_done.wait(&mut remaining);
    }
}

struct OrderedInner<T, C> {
    ///Ring buffer mapping each intermediary result to a slot. A None slot
    ///has not been produced yet (or was already consumed).
    ring: Vec<Option<T>>,
    ///Next index to produce.
    write_idx: usize,
    ///Next index to consume.
    read_idx: usize,
    ///First index that is waited for by the consumer; the producer filling
    ///this slot becomes the consumer.
    consumer_wait_idx: usize,
    last_idx: usize,
    workers_alive: usize,
    ///The consumer closure; taken out of the state while one thread runs a
    ///consumption streak, which keeps consumption exclusive.
    consumer: Option<C>,
}

struct OrderedState<T, C> {
    inner: Mutex<OrderedInner<T, C>>,
    ///Signalled when the consumer frees ring space.
    free_slot: Condvar,
    ///Signalled when the last worker exits.
    work_done: Condvar,
}

///Run the producers for `first..last` in parallel on the pool, but invoke
///`consumer` exactly once per index in strictly increasing index order.
///
///A thread that produces the item currently awaited by the consumer becomes
///the consumer and drains contiguous produced slots, then resumes
///producing. Producers block when the ring of
///`max_pending_per_worker * workers` slots is full. On return, every
///producer has completed.
pub fn run_multiple_producers_ordered_consumer<T, P, C>(
    pool: &ThreadPool,
    first: usize,
    last: usize,
    producer: P,
    consumer: C,
    max_pending_per_worker: usize,
) where
    T: Send,
    P: Fn(usize) -> T + Sync,
    C: FnMut(T) + Send,
{
    if first >= last {
        return;
    }
    assert!(max_pending_per_worker > 0);
    let workers = pool.thread_count() + 1;
    let max_pending = max_pending_per_worker * workers;

    let mut ring = Vec::with_capacity(max_pending);
    ring.resize_with(max_pending, || None);
    // Stack-held state, same lifetime argument as in parallel_for: the
    // workers-alive wait keeps it valid for every task.
    let state = OrderedState {
        inner: Mutex::new(OrderedInner {
            ring,
            write_idx: first,
            read_idx: first,
            consumer_wait_idx: first,
            last_idx: last,
            workers_alive: workers,
            consumer: Some(consumer),
        }),
        free_slot: Condvar::new(),
        work_done: Condvar::new(),
    };
    let state_ref = &state;
    let producer_ref: &(dyn Fn(usize) -> T + Sync) = &producer;

    for _ in 1..workers {
        let task = Box::new(move || ordered_worker(state_ref, producer_ref, max_pending));
        unsafe { pool.push_erased(task) };
    }
    // run one worker on the calling thread
    ordered_worker(&state, producer_ref, max_pending);

    let mut inner = state.inner.lock();
    while inner.workers_alive > 0 {
        state.work_done.wait(&mut inner);
    }
}

fn ordered_worker<T, C: FnMut(T)>(
    state: &OrderedState<T, C>,
    producer: &(dyn Fn(usize) -> T + Sync),
    max_pending: usize,
) {
    let mut inner = state.inner.lock();
    'produce: loop {
        // wait for free ring space, or for the work to run out
        loop {
            if inner.write_idx >= inner.last_idx {
                break 'produce;
            }
            if inner.write_idx - inner.read_idx < max_pending {
                break;
            }
            state.free_slot.wait(&mut inner);
        }

        let produced_idx = inner.write_idx;
        inner.write_idx += 1;

        drop(inner);
        let item = producer(produced_idx);
        inner = state.inner.lock();

        let slot = produced_idx % max_pending;
        debug_assert!(inner.ring[slot].is_none());
        inner.ring[slot] = Some(item);

        if produced_idx == inner.consumer_wait_idx {
            // this thread just produced the item the consumer waits for:
            // drain contiguous produced slots
            let mut consumer = inner
                .consumer
                .take()
                .expect("only the thread producing the awaited item consumes");
            loop {
                let slot = inner.read_idx % max_pending;
                let Some(item) = inner.ring[slot].take() else {
                    break;
                };
                drop(inner);
                consumer(item);
                inner = state.inner.lock();

                let ring_was_full = inner.write_idx - inner.read_idx >= max_pending;
                inner.read_idx += 1;
                if ring_was_full {
                    state.free_slot.notify_one();
                }
            }
            // the producer filling this slot will resume consumption
            inner.consumer_wait_idx = inner.read_idx;
            inner.consumer = Some(consumer);
        }
    }

    // wake producers that waited for a slot while the last items ran
    state.free_slot.notify_all();
    inner.workers_alive -= 1;
    if inner.workers_alive == 0 {
        state.work_done.notify_all();
    }
}
