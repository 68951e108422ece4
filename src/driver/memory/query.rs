//! Filter, update and sort evaluation for the in-memory driver.
//!
//! Implements the subset of MongoDB query semantics the stores rely on.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::driver::{DriverError, Result};

/// Collect every value reachable at a dotted path.
///
/// Arrays fan out: `events.version` yields the `version` of every element of
/// `events`. Numeric path segments index into arrays.
pub(super) fn values_at<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = parts.split_first() {
        if let Some(value) = doc.get(*head) {
            collect(value, rest, &mut out);
        }
    }
    out
}

fn collect<'a>(value: &'a Bson, parts: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(*head) {
                collect(next, rest, out);
            }
        }
        Bson::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    collect(next, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    collect(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

/// Whether `doc` satisfies every condition in `filter`.
pub(super) fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (path, expected) in filter {
        if path.starts_with('$') {
            return Err(DriverError::InvalidOperation(format!(
                "unsupported top-level filter operator {path}"
            )));
        }
        let values = values_at(doc, path);
        let satisfied = match expected {
            Bson::Document(ops) if is_operator_document(ops) => {
                let mut all = true;
                for (op, operand) in ops {
                    let mut any = false;
                    for value in &values {
                        if compare_op(value, op, operand)? {
                            any = true;
                            break;
                        }
                    }
                    if values.is_empty() {
                        // Validate the operator even when the field is absent.
                        any = compare_op(&Bson::Null, op, operand)? && op == "$ne";
                    }
                    if !any {
                        all = false;
                        break;
                    }
                }
                all
            }
            Bson::Null => values.is_empty() || values.iter().any(|v| matches_value(v, expected)),
            _ => values.iter().any(|v| matches_value(v, expected)),
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Equality, where an array value matches if any element matches.
fn matches_value(value: &Bson, expected: &Bson) -> bool {
    if values_equal(value, expected) {
        return true;
    }
    match value {
        Bson::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn compare_op(value: &Bson, op: &str, operand: &Bson) -> Result<bool> {
    let ordering = || compare_values(value, operand);
    Ok(match op {
        "$eq" => matches_value(value, operand),
        "$ne" => !matches_value(value, operand),
        "$gt" => ordering() == Some(Ordering::Greater),
        "$gte" => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => ordering() == Some(Ordering::Less),
        "$lte" => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        "$in" => match operand {
            Bson::Array(candidates) => candidates.iter().any(|c| matches_value(value, c)),
            _ => {
                return Err(DriverError::InvalidOperation(
                    "$in requires an array".to_string(),
                ))
            }
        },
        other => {
            return Err(DriverError::InvalidOperation(format!(
                "unsupported filter operator {other}"
            )))
        }
    })
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality with MongoDB's numeric type coercion (`Int32(1) == Int64(1)`).
pub(super) fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Int32(x), Bson::Int64(y)) | (Bson::Int64(y), Bson::Int32(x)) => {
            i64::from(*x) == *y
        }
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

pub(super) fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::Int32(x), Bson::Int64(y)) => Some(i64::from(*x).cmp(y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(x.cmp(&i64::from(*y))),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

/// Sort documents in place by a `{field: 1 | -1}` specification.
pub(super) fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| {
        for (path, direction) in sort {
            let descending = matches!(as_number(direction), Some(d) if d < 0.0);
            let left = values_at(a, path).into_iter().next();
            let right = values_at(b, path).into_iter().next();
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
            };
            let ordering = if descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Seed document for an upsert: the filter's plain equality conditions.
pub(super) fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (path, value) in filter {
        if path.starts_with('$') || path.contains('.') {
            continue;
        }
        if let Bson::Document(ops) = value {
            if is_operator_document(ops) {
                continue;
            }
        }
        seed.insert(path.clone(), value.clone());
    }
    seed
}

/// Apply an update document (`$set`, `$inc`, `$push`).
pub(super) fn apply_update(doc: &mut Document, update: &Document) -> Result<()> {
    if update.is_empty() || !is_operator_document(update) {
        return Err(DriverError::InvalidOperation(
            "update document must use update operators".to_string(),
        ));
    }
    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(DriverError::InvalidOperation(format!(
                "{op} requires a document"
            )));
        };
        for (path, operand) in fields {
            if path == "_id" {
                let unchanged = op == "$set" && doc.get("_id").is_some_and(|id| values_equal(id, operand));
                if !unchanged {
                    return Err(DriverError::InvalidOperation(
                        "the _id field is immutable".to_string(),
                    ));
                }
                continue;
            }
            match op.as_str() {
                "$set" => set_path(doc, path, operand.clone())?,
                "$inc" => {
                    let current = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
                    set_path(doc, path, add_numbers(&current, operand)?)?;
                }
                "$push" => {
                    let items = match operand {
                        Bson::Document(each) if each.contains_key("$each") => match each.get("$each") {
                            Some(Bson::Array(items)) => items.clone(),
                            _ => {
                                return Err(DriverError::InvalidOperation(
                                    "$each requires an array".to_string(),
                                ))
                            }
                        },
                        single => vec![single.clone()],
                    };
                    match get_path_mut(doc, path) {
                        Some(Bson::Array(existing)) => existing.extend(items),
                        Some(_) => {
                            return Err(DriverError::InvalidOperation(format!(
                                "$push target {path} is not an array"
                            )))
                        }
                        None => set_path(doc, path, Bson::Array(items))?,
                    }
                }
                other => {
                    return Err(DriverError::InvalidOperation(format!(
                        "unsupported update operator {other}"
                    )))
                }
            }
        }
    }
    Ok(())
}

fn add_numbers(current: &Bson, delta: &Bson) -> Result<Bson> {
    Ok(match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a + b),
        _ => match (as_number(current), as_number(delta)) {
            (Some(a), Some(b)) => Bson::Double(a + b),
            _ => {
                return Err(DriverError::InvalidOperation(
                    "$inc requires numeric values".to_string(),
                ))
            }
        },
    })
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get_mut(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get_mut(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match child {
                Bson::Document(inner) => set_path(inner, rest, value),
                _ => Err(DriverError::InvalidOperation(format!(
                    "cannot set {path}: {head} is not a document"
                ))),
            }
        }
    }
}
