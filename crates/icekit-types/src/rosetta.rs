//! Rosetta (IEEE 11073 nomenclature) identifiers used by the bundled
//! drivers. Metric and unit ids are plain strings on the bus.

pub const MDC_DIM_DIMLESS: &str = "MDC_DIM_DIMLESS";
pub const MDC_DIM_PERCENT: &str = "MDC_DIM_PERCENT";
pub const MDC_DIM_BEAT_PER_MIN: &str = "MDC_DIM_BEAT_PER_MIN";

pub const MDC_PULS_OXIM_SAT_O2: &str = "MDC_PULS_OXIM_SAT_O2";
pub const MDC_PULS_OXIM_PULS_RATE: &str = "MDC_PULS_OXIM_PULS_RATE";
pub const MDC_PULS_OXIM_PLETH: &str = "MDC_PULS_OXIM_PLETH";
