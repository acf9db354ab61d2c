//! Location requirement matching.
//!
//! A table may require its replicas to sit on backends whose location
//! label matches one of the allowed values for a key (`rack: [r1, r2]`,
//! or `rack: ["*"]` for any rack). Replicas should also spread over
//! distinct locations.

use std::collections::BTreeSet;

use tabletgrid_state::{Backend, Location, LocationRequirement};

/// Wildcard value accepting every location of a key.
pub const ANY_LOCATION: &str = "*";

pub fn is_location_match(requirement: &LocationRequirement, location: Option<&Location>) -> bool {
    let Some(location) = location else {
        return false;
    };
    requirement.get(&location.key).is_some_and(|values| {
        values.contains(ANY_LOCATION) || values.contains(&location.value)
    })
}

/// Distinct matching locations among the given backends.
pub fn covered_locations<'a>(
    requirement: &LocationRequirement,
    backends: impl IntoIterator<Item = &'a Backend>,
) -> BTreeSet<Location> {
    backends
        .into_iter()
        .filter_map(|b| b.location.as_ref())
        .filter(|loc| is_location_match(requirement, Some(loc)))
        .cloned()
        .collect()
}
