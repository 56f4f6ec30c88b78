use serde_json::{Map, Value};

use super::{display_path, ComponentKind, EditComponent, OtError, PathSegment};

/// Applies `components` to `data` in order.
///
/// Components are applied to a scratch copy so a failure part-way through
/// leaves `data` unchanged.
pub fn apply_components(data: &mut Value, components: &[EditComponent]) -> Result<(), OtError> {
    let mut scratch = data.clone();
    for component in components {
        apply_component(&mut scratch, component)?;
    }
    *data = scratch;
    Ok(())
}

fn apply_component(data: &mut Value, component: &EditComponent) -> Result<(), OtError> {
    let kind = component.kind()?;
    let Some((last, parents)) = component.p.split_last() else {
        // Only ReplaceRoot has an empty path.
        *data = component.oi.clone().unwrap_or(Value::Null);
        return Ok(());
    };

    let create_missing = kind == ComponentKind::ObjectSet;
    let parent = navigate(data, parents, create_missing)?;

    match (kind, last) {
        (ComponentKind::ObjectSet, PathSegment::Key(key)) => {
            let object = as_object(parent, parents)?;
            object.insert(key.clone(), component.oi.clone().unwrap_or(Value::Null));
        }
        (ComponentKind::ObjectDelete, PathSegment::Key(key)) => {
            let object = as_object(parent, parents)?;
            if object.remove(key).is_none() {
                return Err(OtError::MissingPath { path: display_path(&component.p) });
            }
        }
        (ComponentKind::ListInsert, PathSegment::Index(index)) => {
            let list = as_list(parent, parents)?;
            if *index > list.len() {
                return Err(out_of_bounds(parents, *index, list.len()));
            }
            list.insert(*index, component.oi.clone().unwrap_or(Value::Null));
        }
        (ComponentKind::ListDelete, PathSegment::Index(index)) => {
            let list = as_list(parent, parents)?;
            if *index >= list.len() {
                return Err(out_of_bounds(parents, *index, list.len()));
            }
            list.remove(*index);
        }
        (ComponentKind::ListReplace, PathSegment::Index(index)) => {
            let list = as_list(parent, parents)?;
            let len = list.len();
            let slot = list.get_mut(*index).ok_or_else(|| out_of_bounds(parents, *index, len))?;
            *slot = component.oi.clone().unwrap_or(Value::Null);
        }
        _ => {
            return Err(OtError::TypeMismatch {
                path: display_path(&component.p),
                expected: "matching container",
            })
        }
    }
    Ok(())
}

fn navigate<'a>(
    mut current: &'a mut Value,
    path: &[PathSegment],
    create_missing: bool,
) -> Result<&'a mut Value, OtError> {
    for (depth, segment) in path.iter().enumerate() {
        let here = &path[..=depth];
        current = match segment {
            PathSegment::Key(key) => {
                if create_missing && current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let object = current.as_object_mut().ok_or_else(|| OtError::TypeMismatch {
                    path: display_path(&path[..depth]),
                    expected: "object",
                })?;
                if create_missing {
                    object.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()))
                } else {
                    object
                        .get_mut(key)
                        .ok_or_else(|| OtError::MissingPath { path: display_path(here) })?
                }
            }
            PathSegment::Index(index) => {
                let list = current.as_array_mut().ok_or_else(|| OtError::TypeMismatch {
                    path: display_path(&path[..depth]),
                    expected: "list",
                })?;
                let len = list.len();
                list.get_mut(*index).ok_or_else(|| OtError::IndexOutOfBounds {
                    path: display_path(&path[..depth]),
                    index: *index,
                    len,
                })?
            }
        };
    }
    Ok(current)
}

fn as_object<'a>(
    value: &'a mut Value,
    path: &[PathSegment],
) -> Result<&'a mut Map<String, Value>, OtError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .ok_or_else(|| OtError::TypeMismatch { path: display_path(path), expected: "object" })
}

fn as_list<'a>(value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Vec<Value>, OtError> {
    value
        .as_array_mut()
        .ok_or_else(|| OtError::TypeMismatch { path: display_path(path), expected: "list" })
}

fn out_of_bounds(path: &[PathSegment], index: usize, len: usize) -> OtError {
    OtError::IndexOutOfBounds { path: display_path(path), index, len }
}
