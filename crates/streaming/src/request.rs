/// Identifies one layer load in a deterministic, stable way.
///
/// Every fetch started by [`crate::InFlightLoads`] gets a fresh request, so a
/// completion can be matched against the load that is still current for its
/// layer and stale completions (after an unload/reload) can be ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Request(pub u64);
