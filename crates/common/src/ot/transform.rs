use super::{display_path, ComponentKind, EditComponent, Operation, OtError, PathSegment};

/// Rebases `operation` over `committed`, the operations committed to the same
/// document after `operation.base_version`, in commit order.
///
/// Pure: calling it again with the same inputs yields the same result, so a
/// CAS retry can simply run it again against a fresh op range.
pub fn transform(operation: &Operation, committed: &[Operation]) -> Result<Operation, OtError> {
    operation.validate()?;
    committed.iter().try_fold(operation.clone(), |rebased, prior| transform_one(rebased, prior))
}

fn transform_one(mut operation: Operation, prior: &Operation) -> Result<Operation, OtError> {
    if prior.delete {
        return if operation.delete { Ok(operation) } else { Err(OtError::DocumentDeleted) };
    }
    if prior.create.is_some() {
        return if operation.create.is_some() { Err(OtError::DocumentExists) } else { Ok(operation) };
    }
    if operation.create.is_some() || operation.delete {
        return Ok(operation);
    }

    let incoming_wins = operation.precedence() > prior.precedence();
    let mut incoming = std::mem::take(&mut operation.payload);

    for theirs in &prior.payload {
        let mut theirs = Some(theirs.clone());
        let mut rebased = Vec::with_capacity(incoming.len());
        for mine in incoming {
            let Some(current) = theirs.as_ref() else {
                rebased.push(mine);
                continue;
            };
            let mine_rebased = transform_component(&mine, current, Side::Incoming, incoming_wins)?;
            theirs = transform_component(current, &mine, Side::Committed, !incoming_wins)?;
            rebased.extend(mine_rebased);
        }
        incoming = rebased;
    }

    operation.payload = incoming;
    Ok(operation)
}

/// Which side of the pair a component belongs to. Committed components are
/// already applied, so they go first on an insert tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Committed,
    Incoming,
}

/// Transforms `component` so it applies after `other`. `None` means the
/// component no longer has an effect.
fn transform_component(
    component: &EditComponent,
    other: &EditComponent,
    side: Side,
    wins: bool,
) -> Result<Option<EditComponent>, OtError> {
    let kind = component.kind()?;
    let other_kind = other.kind()?;
    let path = &component.p;
    let other_path = &other.p;

    if path == other_path && kind.is_overwrite() && other_kind.is_overwrite() {
        if kind == ComponentKind::ObjectDelete && other_kind == ComponentKind::ObjectDelete {
            // Both removed the same key; nothing is left to remove.
            return Ok(None);
        }
        return Ok(wins.then(|| superseding(component, other)));
    }

    match other_kind {
        ComponentKind::ListInsert | ComponentKind::ListDelete => {
            shift_for_list_edit(component, kind, other, other_kind, side)
        }
        ComponentKind::ReplaceRoot
        | ComponentKind::ObjectSet
        | ComponentKind::ObjectDelete
        | ComponentKind::ListReplace => {
            if is_strict_prefix(other_path, path) {
                // The container this component edits was overwritten.
                return Ok(None);
            }
            if path == other_path && kind == ComponentKind::ListDelete {
                let mut rebased = component.clone();
                rebased.od = other.oi.clone();
                return Ok(Some(rebased));
            }
            Ok(Some(component.clone()))
        }
    }
}

/// The winning overwrite of a same-path pair. Its `od` now names what it
/// replaces.
fn superseding(component: &EditComponent, other: &EditComponent) -> EditComponent {
    let mut rebased = component.clone();
    rebased.od = other.oi.clone();
    rebased
}

fn shift_for_list_edit(
    component: &EditComponent,
    kind: ComponentKind,
    other: &EditComponent,
    other_kind: ComponentKind,
    side: Side,
) -> Result<Option<EditComponent>, OtError> {
    let (other_parent, other_index) = match other.p.split_last() {
        Some((PathSegment::Index(index), parent)) => (parent, *index),
        _ => return Ok(Some(component.clone())),
    };
    let depth = other_parent.len();
    if component.p.len() <= depth || component.p[..depth] != *other_parent {
        return Ok(Some(component.clone()));
    }
    let Some(index) = component.p[depth].as_index() else {
        return Ok(Some(component.clone()));
    };

    let same_list_insert = component.p.len() == depth + 1 && kind == ComponentKind::ListInsert;
    let shifted = match other_kind {
        ComponentKind::ListInsert => {
            let moves = if same_list_insert {
                index > other_index || (index == other_index && side == Side::Incoming)
            } else {
                index >= other_index
            };
            if moves {
                index.checked_add(1).ok_or_else(|| OtError::IndexOutOfBounds {
                    path: display_path(&component.p[..=depth]),
                    index,
                    len: other_index.saturating_add(1),
                })?
            } else {
                index
            }
        }
        ComponentKind::ListDelete => {
            if index > other_index {
                index - 1
            } else if index == other_index && !same_list_insert {
                // The targeted element is gone.
                return Ok(None);
            } else {
                index
            }
        }
        _ => index,
    };

    let mut rebased = component.clone();
    rebased.p[depth] = PathSegment::Index(shifted);
    Ok(Some(rebased))
}

fn is_strict_prefix(prefix: &[PathSegment], path: &[PathSegment]) -> bool {
    prefix.len() < path.len() && path[..prefix.len()] == *prefix
}
