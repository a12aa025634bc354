use crate::{Error, MAX_SLOT, Result, SLOT_CAPACITY};
use std::collections::HashSet;

/// Parses the namespace's last-assigned-slot counter.
///
/// An empty or non-numeric payload counts as no counter at all, so the
/// first claim starts from slot 0.
///
/// # Errors
///
/// Returns [`Error::CounterCorruption`] for a number outside `0..=1023`.
pub fn parse_counter(path: &str, payload: &[u8]) -> Result<Option<u16>> {
    let Some(value) = core::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
    else {
        return Ok(None);
    };
    match u16::try_from(value) {
        Ok(slot) if slot <= MAX_SLOT => Ok(Some(slot)),
        _ => Err(Error::CounterCorruption {
            path: path.to_owned(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }),
    }
}

/// Collects the slots held by live leases from the namespace's child names.
/// Names that are not a slot number are ignored.
pub fn occupied_slots<S: AsRef<str>>(children: &[S]) -> HashSet<u16> {
    children
        .iter()
        .filter_map(|name| name.as_ref().parse::<u16>().ok())
        .filter(|slot| *slot <= MAX_SLOT)
        .collect()
}

/// Picks the first free slot scanning forward from `counter + 1`, wrapping
/// around once. Without a counter the scan starts at 0.
///
/// Returns `None` when every slot is occupied.
///
/// # Example
/// ```
/// use leaseflake::find_free_slot;
/// use std::collections::HashSet;
///
/// let occupied: HashSet<u16> = (0..50).chain(1000..1024).collect();
/// assert_eq!(find_free_slot(Some(1000), &occupied), Some(50));
/// assert_eq!(find_free_slot(None, &HashSet::new()), Some(0));
/// ```
pub fn find_free_slot(counter: Option<u16>, occupied: &HashSet<u16>) -> Option<u16> {
    if occupied.len() >= usize::from(SLOT_CAPACITY) {
        return None;
    }
    let start = counter.map_or(0, |last| (last % SLOT_CAPACITY + 1) % SLOT_CAPACITY);
    (0..SLOT_CAPACITY)
        .map(|offset| (start + offset) % SLOT_CAPACITY)
        .find(|slot| !occupied.contains(slot))
}
