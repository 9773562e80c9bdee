mod heap;

pub use heap::{
    FinalizeFn, Heap, HeapProxy, HeapSettings, RootProvider, TraceFn,
    TraceStats,
};
