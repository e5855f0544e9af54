//! Splitting changed instances into canary and bulk work.

/// Splits `items` into the first `canaries` items and the rest.
///
/// Order is preserved on both sides, so the canary set is deterministic
/// for a given input order.
pub fn partition_canaries<T>(mut items: Vec<T>, canaries: usize) -> (Vec<T>, Vec<T>) {
    let at = canaries.min(items.len());
    let rest = items.split_off(at);
    (items, rest)
}

/// Groups `items` by availability zone.
///
/// Zones appear in the order they are first seen; items without a zone
/// share one group. Order within a group is preserved.
pub fn group_by_zone<T, F>(items: Vec<T>, zone_of: F) -> Vec<Vec<T>>
where
    F: Fn(&T) -> Option<&str>,
{
    let mut zones: Vec<Option<String>> = Vec::new();
    let mut groups: Vec<Vec<T>> = Vec::new();

    for item in items {
        let zone = zone_of(&item).map(str::to_string);
        match zones.iter().position(|z| *z == zone) {
            Some(i) => groups[i].push(item),
            None => {
                zones.push(zone);
                groups.push(vec![item]);
            }
        }
    }

    groups
}
