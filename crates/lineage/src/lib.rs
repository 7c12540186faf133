//! lineage - Sealed contracts and deterministic lineage hashing.
//!
//! The coordinator, instrument agents, and section children hand work to
//! each other through frozen contract values. Each contract carries a
//! 16-hex-char structural hash sealed at construction, with a
//! `parent_contract_hash` linking it to the layer above. Execution
//! results are attested with `execution_hash(contract_hash, trace_id)`,
//! so a result replayed from another session is detectable.

pub mod contracts;
pub mod hash;

pub use contracts::{CompositionContract, InstrumentContract, SectionContract, SectionSpec};
pub use hash::{
    canonical_value, compute_contract_hash, execution_hash, hash_list, short_hash, HashError,
    EXCLUDED_FIELDS, SHORT_HASH_LEN,
};
