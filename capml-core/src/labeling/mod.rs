//! Rule-based entry detection and triple-barrier meta-labels.

pub mod entries;
pub mod triple_barrier;

pub use entries::{detect_entries, EntryEvent, EntryRule};
pub use triple_barrier::{
    label_entries, label_entries_with_sigma, volatility_series, Barrier, MetaLabel,
    TripleBarrierParams, SIGMA_FLOOR,
};
