#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use num_traits::Float;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Precision constants of the floating-point format backing this dtype.
    #[must_use]
    pub fn finfo(self) -> FloatInfo {
        match self {
            Self::F32 => FloatInfo {
                bits: 32,
                eps: f64::from(f32::EPSILON),
                tiny: f64::from(f32::MIN_POSITIVE),
                max: f64::from(f32::MAX),
            },
            Self::F64 => FloatInfo {
                bits: 64,
                eps: f64::EPSILON,
                tiny: f64::MIN_POSITIVE,
                max: f64::MAX,
            },
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }
}

/// Machine epsilon, smallest normal value and largest finite value of a
/// float format, widened to `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatInfo {
    pub bits: u32,
    pub eps: f64,
    pub tiny: f64,
    pub max: f64,
}

/// Element types a [`DenseTensor`] can store.
pub trait FloatElement: Float + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    /// Rounds an `f64` to this precision; out-of-range values saturate to infinity.
    fn cast_from(value: f64) -> Self;

    fn as_f64(self) -> f64;

    fn slice_of(storage: &Storage) -> Option<&[Self]>;
}

impl FloatElement for f32 {
    const DTYPE: DType = DType::F32;

    fn cast_from(value: f64) -> Self {
        value as f32
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }

    fn slice_of(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F32(values) => Some(values.as_slice()),
            Storage::F64(_) => None,
        }
    }
}

impl FloatElement for f64 {
    const DTYPE: DType = DType::F64;

    fn cast_from(value: f64) -> Self {
        value
    }

    fn as_f64(self) -> f64 {
        self
    }

    fn slice_of(storage: &Storage) -> Option<&[Self]> {
        match storage {
            Storage::F64(values) => Some(values.as_slice()),
            Storage::F32(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("shape {shape:?} expects {expected} elements, storage holds {actual}")]
    NumelMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("cannot reshape {from:?} into {to:?}")]
    ReshapeMismatch { from: Vec<usize>, to: Vec<usize> },
    #[error("concatenation needs at least one tensor")]
    EmptyConcat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Storage {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    fn from_f64_values(values: Vec<f64>, dtype: DType) -> Self {
        match dtype {
            DType::F32 => Self::F32(values.into_iter().map(f32::cast_from).collect()),
            DType::F64 => Self::F64(values),
        }
    }
}

/// Contiguous tensor with shared, immutable storage.
///
/// Every tensor carries a process-unique id; views created by [`reshape`]
/// keep the storage id of their source.
///
/// [`reshape`]: DenseTensor::reshape
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    storage_id: u64,
    meta: TensorMeta,
    storage: Arc<Storage>,
}

impl DenseTensor {
    pub fn from_storage(storage: Storage, shape: Vec<usize>) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, storage.dtype());
        let expected = meta.numel();
        if expected != storage.len() {
            return Err(TensorError::NumelMismatch {
                shape: meta.shape,
                expected,
                actual: storage.len(),
            });
        }
        Ok(Self {
            id: next_tensor_id(),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta,
            storage: Arc::new(storage),
        })
    }

    pub fn from_f32(values: Vec<f32>, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::from_storage(Storage::F32(values), shape)
    }

    pub fn from_f64(values: Vec<f64>, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::from_storage(Storage::F64(values), shape)
    }

    /// Builds a tensor of `dtype` from `f64` values, rounding when `dtype` is narrower.
    pub fn from_values(
        values: Vec<f64>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Self, TensorError> {
        Self::from_storage(Storage::from_f64_values(values, dtype), shape)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64, dtype: DType) -> Self {
        let numel = TensorMeta::from_shape(shape.clone(), dtype).numel();
        let storage = Storage::from_f64_values(vec![value; numel], dtype);
        Self {
            id: next_tensor_id(),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta: TensorMeta::from_shape(shape, dtype),
            storage: Arc::new(storage),
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    #[must_use]
    pub fn ones(shape: Vec<usize>, dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Flat values in storage order, widened to `f64`.
    #[must_use]
    pub fn values_f64(&self) -> Vec<f64> {
        match self.storage.as_ref() {
            Storage::F32(values) => values.iter().copied().map(f64::from).collect(),
            Storage::F64(values) => values.clone(),
        }
    }

    /// View of the same storage under a new shape.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape, self.dtype());
        if meta.numel() != self.storage.len() {
            return Err(TensorError::ReshapeMismatch {
                from: self.shape().to_vec(),
                to: meta.shape,
            });
        }
        Ok(Self {
            id: next_tensor_id(),
            storage_id: self.storage_id,
            meta,
            storage: Arc::clone(&self.storage),
        })
    }

    #[must_use]
    pub fn flatten(&self) -> Self {
        Self {
            id: next_tensor_id(),
            storage_id: self.storage_id,
            meta: TensorMeta::from_shape(vec![self.storage.len()], self.dtype()),
            storage: Arc::clone(&self.storage),
        }
    }

    /// Out-of-place elementwise map; the result gets fresh storage of the same dtype.
    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let values = self.values_f64().into_iter().map(f).collect();
        Self {
            id: next_tensor_id(),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta: self.meta.clone(),
            storage: Arc::new(Storage::from_f64_values(values, self.dtype())),
        }
    }

    #[must_use]
    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype() {
            return self.clone();
        }
        Self {
            id: next_tensor_id(),
            storage_id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            meta: TensorMeta::from_shape(self.shape().to_vec(), dtype),
            storage: Arc::new(Storage::from_f64_values(self.values_f64(), dtype)),
        }
    }

    /// Flattens and concatenates `tensors` into one rank-1 tensor.
    ///
    /// The result is `F32` only when every input is `F32`.
    pub fn concat_flat(tensors: &[Self]) -> Result<Self, TensorError> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyConcat);
        }
        let total = tensors.iter().map(Self::numel).sum::<usize>();
        let storage = if tensors.iter().all(|tensor| tensor.dtype() == DType::F32) {
            let mut values = Vec::with_capacity(total);
            for tensor in tensors {
                if let Some(slice) = f32::slice_of(tensor.storage()) {
                    values.extend_from_slice(slice);
                }
            }
            Storage::F32(values)
        } else {
            let mut values = Vec::with_capacity(total);
            for tensor in tensors {
                values.extend(tensor.values_f64());
            }
            Storage::F64(values)
        };
        Self::from_storage(storage, vec![total])
    }
}

fn next_tensor_id() -> u64 {
    NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// Shared, mutable list. Lists are compared by identity and may contain themselves.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// Dynamic value flowing through module calls and structure logging.
#[derive(Clone)]
pub enum Value {
    Tensor(DenseTensor),
    List(ListRef),
    Scalar(f64),
    Text(String),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Tensor,
    List,
    Other,
}

impl Value {
    #[must_use]
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(new_list(items))
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Tensor(_) => ValueKind::Tensor,
            Self::List(_) => ValueKind::List,
            Self::Scalar(_) | Self::Text(_) | Self::None => ValueKind::Other,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&DenseTensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }
}

impl From<DenseTensor> for Value {
    fn from(tensor: DenseTensor) -> Self {
        Self::Tensor(tensor)
    }
}

impl From<ListRef> for Value {
    fn from(list: ListRef) -> Self {
        Self::List(list)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl fmt::Debug for Value {
    // Lists may be cyclic, so they print their identity instead of contents.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(tensor) => write!(
                f,
                "Tensor(id={}, shape={:?}, dtype={:?})",
                tensor.id(),
                tensor.shape(),
                tensor.dtype()
            ),
            Self::List(list) => match list.try_borrow() {
                Ok(items) => write!(f, "List(len={}, at=0x{:x})", items.len(), list_identity(list)),
                Err(_) => write!(f, "List(<borrowed>, at=0x{:x})", list_identity(list)),
            },
            Self::Scalar(value) => write!(f, "Scalar({value})"),
            Self::Text(text) => write!(f, "Text({text:?})"),
            Self::None => f.write_str("None"),
        }
    }
}

#[must_use]
pub fn new_list(items: impl IntoIterator<Item = Value>) -> ListRef {
    Rc::new(RefCell::new(items.into_iter().collect()))
}

/// Address-based identity of a shared list.
#[must_use]
pub fn list_identity(list: &ListRef) -> usize {
    Rc::as_ptr(list) as usize
}
