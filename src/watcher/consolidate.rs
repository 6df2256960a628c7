// Event consolidation
//
// Collapses the per-path event sequence accumulated between drains into a
// minimal equivalent change. The rules, applied pairwise in order:
//
//   1. add then unlink (same kind): both drop.
//   2. unlink then add: update.
//   3. add then add with equal fingerprints, or either missing: keep one.
//   4. any other second mutation: update.
//
// Consolidation is idempotent: running it over its own output is a no-op.

use crate::index::ChangeType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub change_type: ChangeType,
    pub fingerprint: Option<String>,
}

impl PendingEvent {
    pub fn new(change_type: ChangeType) -> Self {
        Self {
            change_type,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(change_type: ChangeType, fingerprint: Option<String>) -> Self {
        Self {
            change_type,
            fingerprint,
        }
    }
}

fn is_add(t: ChangeType) -> bool {
    matches!(t, ChangeType::Add | ChangeType::AddDir)
}

fn is_unlink(t: ChangeType) -> bool {
    matches!(t, ChangeType::Unlink | ChangeType::UnlinkDir)
}

fn same_kind(a: ChangeType, b: ChangeType) -> bool {
    a.is_dir() == b.is_dir()
}

/// Fold one path's event sequence into at most one change.
pub fn consolidate(events: &[PendingEvent]) -> Option<PendingEvent> {
    let mut current: Option<PendingEvent> = None;

    for next in events {
        current = match current {
            None => Some(next.clone()),
            Some(cur) => fold_pair(cur, next),
        };
    }

    current
}

fn fold_pair(cur: PendingEvent, next: &PendingEvent) -> Option<PendingEvent> {
    let a = cur.change_type;
    let b = next.change_type;

    // Rule 1: a create cancelled by a matching delete.
    if is_add(a) && is_unlink(b) && same_kind(a, b) {
        return None;
    }

    // Rule 2: delete then recreate is an update.
    if is_unlink(a) && is_add(b) {
        return Some(PendingEvent::with_fingerprint(
            ChangeType::Update,
            next.fingerprint.clone(),
        ));
    }

    // Rule 3: duplicate adds. Equal fingerprints, or a missing one on
    // either side, deduplicate to a single add (the newer fingerprint
    // wins so a later real change still compares correctly).
    if a == ChangeType::Add && b == ChangeType::Add {
        match (&cur.fingerprint, &next.fingerprint) {
            (Some(fa), Some(fb)) if fa != fb => {
                return Some(PendingEvent::with_fingerprint(
                    ChangeType::Update,
                    next.fingerprint.clone(),
                ))
            }
            _ => {
                return Some(PendingEvent::with_fingerprint(
                    ChangeType::Add,
                    next.fingerprint.clone().or(cur.fingerprint),
                ))
            }
        }
    }
    if a == ChangeType::AddDir && b == ChangeType::AddDir {
        return Some(cur);
    }

    // Rule 4: anything else ending in a second mutation.
    Some(PendingEvent::with_fingerprint(
        ChangeType::Update,
        next.fingerprint.clone().or(cur.fingerprint),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(t: ChangeType) -> PendingEvent {
        PendingEvent::new(t)
    }

    fn add_fp(fp: &str) -> PendingEvent {
        PendingEvent::with_fingerprint(ChangeType::Add, Some(fp.to_string()))
    }

    #[test]
    fn test_add_then_unlink_annihilates() {
        assert_eq!(
            consolidate(&[ev(ChangeType::Add), ev(ChangeType::Unlink)]),
            None
        );
        assert_eq!(
            consolidate(&[ev(ChangeType::AddDir), ev(ChangeType::UnlinkDir)]),
            None
        );
    }

    #[test]
    fn test_add_then_unlink_kind_mismatch_is_update() {
        // A file add followed by a directory unlink is not the same entity.
        let out = consolidate(&[ev(ChangeType::Add), ev(ChangeType::UnlinkDir)]).unwrap();
        assert_eq!(out.change_type, ChangeType::Update);
    }

    #[test]
    fn test_unlink_then_add_is_update() {
        let out = consolidate(&[ev(ChangeType::Unlink), ev(ChangeType::Add)]).unwrap();
        assert_eq!(out.change_type, ChangeType::Update);
    }

    #[test]
    fn test_duplicate_adds_equal_fingerprint_kept_once() {
        let out = consolidate(&[add_fp("x"), add_fp("x")]).unwrap();
        assert_eq!(out.change_type, ChangeType::Add);
    }

    #[test]
    fn test_duplicate_adds_missing_fingerprint_kept_once() {
        // Fingerprint unreadable on either side: keep one, no starvation.
        let out = consolidate(&[ev(ChangeType::Add), add_fp("x")]).unwrap();
        assert_eq!(out.change_type, ChangeType::Add);
        let out = consolidate(&[add_fp("x"), ev(ChangeType::Add)]).unwrap();
        assert_eq!(out.change_type, ChangeType::Add);
    }

    #[test]
    fn test_duplicate_adds_different_fingerprint_is_update() {
        let out = consolidate(&[add_fp("x"), add_fp("y")]).unwrap();
        assert_eq!(out.change_type, ChangeType::Update);
    }

    #[test]
    fn test_triple_sequence() {
        // add, unlink, add: the first pair cancels, the trailing add stays.
        let out = consolidate(&[
            ev(ChangeType::Add),
            ev(ChangeType::Unlink),
            ev(ChangeType::Add),
        ])
        .unwrap();
        assert_eq!(out.change_type, ChangeType::Add);
    }

    #[test]
    fn test_consolidation_idempotent() {
        let sequences: Vec<Vec<PendingEvent>> = vec![
            vec![ev(ChangeType::Add), ev(ChangeType::Unlink)],
            vec![ev(ChangeType::Unlink), ev(ChangeType::Add)],
            vec![add_fp("x"), add_fp("x")],
            vec![add_fp("x"), add_fp("y")],
            vec![ev(ChangeType::Update), ev(ChangeType::Add)],
            vec![
                ev(ChangeType::AddDir),
                ev(ChangeType::UnlinkDir),
                ev(ChangeType::AddDir),
            ],
        ];

        for seq in sequences {
            let once = consolidate(&seq);
            let twice = match &once {
                Some(e) => consolidate(std::slice::from_ref(e)),
                None => None,
            };
            assert_eq!(once, twice, "sequence {:?}", seq);
        }
    }
}
