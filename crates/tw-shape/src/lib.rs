#![forbid(unsafe_code)]

//! Shape descriptors for arbitrarily nested, possibly cyclic values.
//!
//! Lists are tracked by identity for the duration of one top-level call. A
//! list reached a second time is reported as [`ShapeDescriptor::Seen`], which
//! serializes as the integer `0`.

use std::collections::HashSet;

use serde::{Serialize, Serializer};
use tw_core::{DenseTensor, ListRef, Value, list_identity};

/// Identities of the lists already entered during one inspection.
pub type VisitedSet = HashSet<usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeDescriptor {
    /// Dimension sizes of a tensor.
    Dims(Vec<usize>),
    /// One descriptor per element of a list.
    Nested(Vec<ShapeDescriptor>),
    /// Back-reference to a list already visited in this call.
    Seen,
}

impl ShapeDescriptor {
    /// Descriptor of a value that is neither a tensor nor a list.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Nested(Vec::new())
    }

    #[must_use]
    pub fn is_seen(&self) -> bool {
        matches!(self, Self::Seen)
    }
}

impl Serialize for ShapeDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Dims(dims) => dims.serialize(serializer),
            Self::Nested(items) => items.serialize(serializer),
            Self::Seen => serializer.serialize_u8(0),
        }
    }
}

struct Frame {
    list: ListRef,
    next: usize,
    shapes: Vec<ShapeDescriptor>,
}

impl Frame {
    fn new(list: ListRef) -> Self {
        Self {
            list,
            next: 0,
            shapes: Vec::new(),
        }
    }
}

enum Step {
    Leaf(ShapeDescriptor),
    Descend(ListRef),
    Finish,
}

/// Shape descriptor of `value` with a fresh visited set.
#[must_use]
pub fn nested_shape(value: &Value) -> ShapeDescriptor {
    let mut visited = VisitedSet::new();
    shape_of(value, &mut visited)
}

/// Shape descriptor of `value`, sharing `visited` with the caller.
///
/// Lists already present in `visited` yield [`ShapeDescriptor::Seen`]. A list
/// that is mutably borrowed while being inspected is reported up to the
/// elements read so far.
pub fn shape_of(value: &Value, visited: &mut VisitedSet) -> ShapeDescriptor {
    let root = match value {
        Value::Tensor(tensor) => return ShapeDescriptor::Dims(tensor.shape().to_vec()),
        Value::List(list) => list.clone(),
        Value::Scalar(_) | Value::Text(_) | Value::None => return ShapeDescriptor::empty(),
    };
    if !visited.insert(list_identity(&root)) {
        return ShapeDescriptor::Seen;
    }

    let mut stack = vec![Frame::new(root)];
    while let Some(frame) = stack.last_mut() {
        let step = match frame.list.try_borrow() {
            Ok(items) => match items.get(frame.next) {
                None => Step::Finish,
                Some(Value::Tensor(tensor)) => {
                    Step::Leaf(ShapeDescriptor::Dims(tensor.shape().to_vec()))
                }
                Some(Value::List(child)) => {
                    if visited.insert(list_identity(child)) {
                        Step::Descend(child.clone())
                    } else {
                        Step::Leaf(ShapeDescriptor::Seen)
                    }
                }
                Some(Value::Scalar(_) | Value::Text(_) | Value::None) => {
                    Step::Leaf(ShapeDescriptor::empty())
                }
            },
            Err(_) => Step::Finish,
        };
        frame.next += 1;

        match step {
            Step::Leaf(shape) => frame.shapes.push(shape),
            Step::Descend(child) => stack.push(Frame::new(child)),
            Step::Finish => {
                let Some(done) = stack.pop() else {
                    break;
                };
                let shape = ShapeDescriptor::Nested(done.shapes);
                match stack.last_mut() {
                    Some(parent) => parent.shapes.push(shape),
                    None => return shape,
                }
            }
        }
    }
    ShapeDescriptor::empty()
}

/// Every tensor reachable from `value`, in depth-first order, each list
/// entered at most once.
#[must_use]
pub fn collect_tensors(value: &Value) -> Vec<DenseTensor> {
    let mut visited = VisitedSet::new();
    let mut tensors = Vec::new();
    let mut pending = vec![value.clone()];
    while let Some(current) = pending.pop() {
        match current {
            Value::Tensor(tensor) => tensors.push(tensor),
            Value::List(list) => {
                if !visited.insert(list_identity(&list)) {
                    continue;
                }
                if let Ok(items) = list.try_borrow() {
                    pending.extend(items.iter().rev().cloned());
                }
            }
            Value::Scalar(_) | Value::Text(_) | Value::None => {}
        }
    }
    tensors
}
