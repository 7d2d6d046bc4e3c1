#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use thiserror::Error;
use tracing::debug;
use tw_core::{DenseTensor, TensorError, Value, ValueKind};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PARAMETER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NnError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("{layer} expects a tensor input, got {kind:?}")]
    ExpectedTensor {
        layer: &'static str,
        kind: ValueKind,
    },
    #[error("{layer} expects {expected} input features, got shape {shape:?}")]
    InputFeatures {
        layer: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },
    #[error("gradient shape {actual:?} does not match {expected:?}")]
    GradientShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected parameter shape {expected:?}, got {actual:?}")]
    ParameterShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("linear weight must be rank 2, got shape {shape:?}")]
    WeightShape { shape: Vec<usize> },
    #[error("linear layer requires in_features > 0")]
    ZeroFeatures,
    #[error("cannot register a gradient hook on parameter {parameter} that does not require grad")]
    FrozenParameter { parameter: u64 },
}

/// Process-unique identity of a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    fn next() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Arguments seen by a forward hook after the module produced its output.
pub struct ForwardEvent<'a> {
    pub module: ModuleId,
    pub input: &'a Value,
    pub output: &'a Value,
}

pub type ForwardHook = dyn Fn(&ForwardEvent<'_>);
pub type GradHook = dyn Fn(&DenseTensor);

struct HookTable<F: ?Sized> {
    next_id: u64,
    hooks: Vec<(u64, Rc<F>)>,
}

impl<F: ?Sized> HookTable<F> {
    fn new() -> Self {
        Self {
            next_id: 0,
            hooks: Vec::new(),
        }
    }

    // Hooks may remove themselves while running, so callers iterate a copy.
    fn snapshot(&self) -> Vec<Rc<F>> {
        self.hooks.iter().map(|(_, hook)| Rc::clone(hook)).collect()
    }
}

trait HookRegistry {
    fn remove_hook(&self, id: u64) -> bool;
}

impl<F: ?Sized> HookRegistry for RefCell<HookTable<F>> {
    fn remove_hook(&self, id: u64) -> bool {
        let mut table = self.borrow_mut();
        let before = table.hooks.len();
        table.hooks.retain(|(hook_id, _)| *hook_id != id);
        table.hooks.len() != before
    }
}

fn insert_hook<F: ?Sized + 'static>(table: &Rc<RefCell<HookTable<F>>>, hook: Rc<F>) -> HookHandle {
    let id = {
        let mut inner = table.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.hooks.push((id, hook));
        id
    };
    let registry: Rc<dyn HookRegistry> = table.clone();
    HookHandle {
        id,
        registry: Rc::downgrade(&registry),
    }
}

/// Removable registration of a forward or gradient hook.
///
/// Dropping the handle leaves the hook installed; call [`HookHandle::remove`].
#[derive(Debug, Clone)]
pub struct HookHandle {
    id: u64,
    registry: Weak<dyn HookRegistry>,
}

impl HookHandle {
    /// Uninstalls the hook. Returns `false` if it was already removed or its
    /// owner is gone.
    pub fn remove(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove_hook(self.id))
    }
}

/// Identity and forward-hook table shared by every module.
pub struct ModuleBase {
    id: ModuleId,
    forward_hooks: Rc<RefCell<HookTable<ForwardHook>>>,
}

impl ModuleBase {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ModuleId::next(),
            forward_hooks: Rc::new(RefCell::new(HookTable::new())),
        }
    }

    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn register_forward_hook(
        &self,
        hook: impl Fn(&ForwardEvent<'_>) + 'static,
    ) -> HookHandle {
        let hook: Rc<ForwardHook> = Rc::new(hook);
        let handle = insert_hook(&self.forward_hooks, hook);
        debug!(module = self.id.get(), hook = handle.id, "forward hook registered");
        handle
    }

    #[must_use]
    pub fn forward_hook_count(&self) -> usize {
        self.forward_hooks.borrow().hooks.len()
    }

    fn fire_forward(&self, event: &ForwardEvent<'_>) {
        let hooks = self.forward_hooks.borrow().snapshot();
        for hook in hooks {
            hook(event);
        }
    }
}

impl Default for ModuleBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for neural network modules.
///
/// Hosts run modules through [`Module::call`], which invokes `forward` and
/// then every registered forward hook.
pub trait Module {
    fn base(&self) -> &ModuleBase;

    /// Human-readable description including the layer's configuration.
    fn class_name(&self) -> String;

    fn forward(&self, input: Value) -> Result<Value, NnError>;

    /// Parameters owned directly by this module, not by its children.
    fn parameters(&self) -> Vec<(String, Parameter)> {
        Vec::new()
    }

    fn named_children(&self) -> Vec<(String, &dyn Module)> {
        Vec::new()
    }

    /// Containers only route their input through children.
    fn is_container(&self) -> bool {
        false
    }

    fn id(&self) -> ModuleId {
        self.base().id()
    }

    fn call(&self, input: Value) -> Result<Value, NnError> {
        let output = self.forward(input.clone())?;
        self.base().fire_forward(&ForwardEvent {
            module: self.id(),
            input: &input,
            output: &output,
        });
        Ok(output)
    }
}

/// Every parameter of `module` and its descendants, named by dotted path.
#[must_use]
pub fn named_parameters(module: &dyn Module) -> Vec<(String, Parameter)> {
    let mut out = Vec::new();
    collect_parameters(module, "", &mut out);
    out
}

fn collect_parameters(module: &dyn Module, prefix: &str, out: &mut Vec<(String, Parameter)>) {
    for (name, parameter) in module.parameters() {
        out.push((format!("{prefix}{name}"), parameter));
    }
    for (name, child) in module.named_children() {
        collect_parameters(child, &format!("{prefix}{name}."), out);
    }
}

struct ParameterInner {
    id: u64,
    data: RefCell<DenseTensor>,
    grad: RefCell<Option<DenseTensor>>,
    requires_grad: Cell<bool>,
    grad_hooks: Rc<RefCell<HookTable<GradHook>>>,
}

/// Shared handle to a trainable tensor and its accumulated gradient.
#[derive(Clone)]
pub struct Parameter {
    inner: Rc<ParameterInner>,
}

impl Parameter {
    #[must_use]
    pub fn new(data: DenseTensor) -> Self {
        Self {
            inner: Rc::new(ParameterInner {
                id: NEXT_PARAMETER_ID.fetch_add(1, Ordering::Relaxed),
                data: RefCell::new(data),
                grad: RefCell::new(None),
                requires_grad: Cell::new(true),
                grad_hooks: Rc::new(RefCell::new(HookTable::new())),
            }),
        }
    }

    #[must_use]
    pub fn frozen(data: DenseTensor) -> Self {
        let parameter = Self::new(data);
        parameter.set_requires_grad(false);
        parameter
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn data(&self) -> DenseTensor {
        self.inner.data.borrow().clone()
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.inner.data.borrow().shape().to_vec()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.inner.data.borrow().numel()
    }

    /// Replaces the values; the shape must not change.
    pub fn set_data(&self, data: DenseTensor) -> Result<(), NnError> {
        let expected = self.shape();
        if data.shape() != expected.as_slice() {
            return Err(NnError::ParameterShape {
                expected,
                actual: data.shape().to_vec(),
            });
        }
        *self.inner.data.borrow_mut() = data;
        Ok(())
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad.get()
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.inner.requires_grad.set(requires_grad);
    }

    #[must_use]
    pub fn grad(&self) -> Option<DenseTensor> {
        self.inner.grad.borrow().clone()
    }

    pub fn zero_grad(&self) {
        *self.inner.grad.borrow_mut() = None;
    }

    /// Installs a hook that sees every incoming gradient before it is accumulated.
    pub fn register_grad_hook(
        &self,
        hook: impl Fn(&DenseTensor) + 'static,
    ) -> Result<HookHandle, NnError> {
        if !self.requires_grad() {
            return Err(NnError::FrozenParameter {
                parameter: self.inner.id,
            });
        }
        let hook: Rc<GradHook> = Rc::new(hook);
        let handle = insert_hook(&self.inner.grad_hooks, hook);
        debug!(parameter = self.inner.id, hook = handle.id, "gradient hook registered");
        Ok(handle)
    }

    #[must_use]
    pub fn grad_hook_count(&self) -> usize {
        self.inner.grad_hooks.borrow().hooks.len()
    }

    /// Delivers one gradient: runs the gradient hooks, then adds `grad` to
    /// the stored gradient. Parameters that do not require grad ignore it.
    pub fn accumulate_grad(&self, grad: DenseTensor) -> Result<(), NnError> {
        if !self.requires_grad() {
            return Ok(());
        }
        let expected = self.shape();
        if grad.shape() != expected.as_slice() {
            return Err(NnError::GradientShape {
                expected,
                actual: grad.shape().to_vec(),
            });
        }

        let hooks = self.inner.grad_hooks.borrow().snapshot();
        for hook in hooks {
            hook(&grad);
        }

        let dtype = self.inner.data.borrow().dtype();
        let mut stored = self.inner.grad.borrow_mut();
        let summed = match stored.as_ref() {
            Some(previous) => {
                let values = previous
                    .values_f64()
                    .into_iter()
                    .zip(grad.values_f64())
                    .map(|(lhs, rhs)| lhs + rhs)
                    .collect();
                DenseTensor::from_values(values, expected, dtype)?
            }
            None => grad.to_dtype(dtype),
        };
        *stored = Some(summed);
        Ok(())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.inner.id)
            .field("shape", &self.shape())
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}

fn expect_tensor<'a>(layer: &'static str, input: &'a Value) -> Result<&'a DenseTensor, NnError> {
    input.as_tensor().ok_or_else(|| NnError::ExpectedTensor {
        layer,
        kind: input.kind(),
    })
}

/// Fully connected linear layer: output = input @ weight^T + bias.
pub struct Linear {
    base: ModuleBase,
    weight: Parameter,
    bias: Option<Parameter>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Create a new Linear layer with values drawn from `U(-bound, bound)`,
    /// `bound = sqrt(1 / in_features)`.
    ///
    /// `weight` has shape `[out_features, in_features]`, `bias` `[out_features]`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        rng: &mut impl Rng,
    ) -> Result<Self, NnError> {
        if in_features == 0 {
            return Err(NnError::ZeroFeatures);
        }
        let bound = 1.0 / (in_features as f64).sqrt();
        let mut uniform = |count: usize| {
            (0..count)
                .map(|_| rng.gen_range(-bound..bound))
                .collect::<Vec<f64>>()
        };
        let weight = DenseTensor::from_f32(
            uniform(out_features * in_features)
                .into_iter()
                .map(|value| value as f32)
                .collect(),
            vec![out_features, in_features],
        )?;
        let bias = if use_bias {
            Some(DenseTensor::from_f32(
                uniform(out_features)
                    .into_iter()
                    .map(|value| value as f32)
                    .collect(),
                vec![out_features],
            )?)
        } else {
            None
        };
        Self::from_tensors(weight, bias)
    }

    /// Builds a layer around explicit weight `[out, in]` and bias `[out]` tensors.
    pub fn from_tensors(weight: DenseTensor, bias: Option<DenseTensor>) -> Result<Self, NnError> {
        let &[out_features, in_features] = weight.shape() else {
            return Err(NnError::WeightShape {
                shape: weight.shape().to_vec(),
            });
        };
        if in_features == 0 {
            return Err(NnError::ZeroFeatures);
        }
        if let Some(bias) = &bias {
            if bias.shape() != [out_features] {
                return Err(NnError::ParameterShape {
                    expected: vec![out_features],
                    actual: bias.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            base: ModuleBase::new(),
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
            in_features,
            out_features,
        })
    }

    #[must_use]
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    // Accepts `[in]` or `[batch, in]`; returns the batch size and whether the
    // batch dimension was implicit.
    fn batch_of(&self, input: &DenseTensor) -> Result<(usize, bool), NnError> {
        match *input.shape() {
            [features] if features == self.in_features => Ok((1, true)),
            [batch, features] if features == self.in_features => Ok((batch, false)),
            _ => Err(NnError::InputFeatures {
                layer: "Linear",
                expected: self.in_features,
                shape: input.shape().to_vec(),
            }),
        }
    }

    /// Delivers the weight and bias gradients for one forward call to the
    /// parameters and returns the gradient with respect to `input`.
    pub fn backward(
        &self,
        input: &DenseTensor,
        grad_output: &DenseTensor,
    ) -> Result<DenseTensor, NnError> {
        let (batch, squeeze) = self.batch_of(input)?;
        let expected_out = if squeeze {
            vec![self.out_features]
        } else {
            vec![batch, self.out_features]
        };
        if grad_output.shape() != expected_out.as_slice() {
            return Err(NnError::GradientShape {
                expected: expected_out,
                actual: grad_output.shape().to_vec(),
            });
        }

        let (n_in, n_out) = (self.in_features, self.out_features);
        let x = input.values_f64();
        let go = grad_output.values_f64();
        let w = self.weight.data().values_f64();

        let mut grad_weight = vec![0.0; n_out * n_in];
        let mut grad_bias = vec![0.0; n_out];
        let mut grad_input = vec![0.0; batch * n_in];
        for row in 0..batch {
            for o in 0..n_out {
                let g = go[row * n_out + o];
                grad_bias[o] += g;
                for i in 0..n_in {
                    grad_weight[o * n_in + i] += g * x[row * n_in + i];
                    grad_input[row * n_in + i] += g * w[o * n_in + i];
                }
            }
        }

        let weight_dtype = self.weight.data().dtype();
        self.weight.accumulate_grad(DenseTensor::from_values(
            grad_weight,
            vec![n_out, n_in],
            weight_dtype,
        )?)?;
        if let Some(bias) = &self.bias {
            let bias_dtype = bias.data().dtype();
            bias.accumulate_grad(DenseTensor::from_values(
                grad_bias,
                vec![n_out],
                bias_dtype,
            )?)?;
        }
        Ok(DenseTensor::from_values(
            grad_input,
            input.shape().to_vec(),
            input.dtype(),
        )?)
    }
}

impl Module for Linear {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn class_name(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={}, bias={})",
            self.in_features,
            self.out_features,
            if self.bias.is_some() { "True" } else { "False" }
        )
    }

    fn forward(&self, input: Value) -> Result<Value, NnError> {
        let x = expect_tensor("Linear", &input)?;
        let (batch, squeeze) = self.batch_of(x)?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        let xs = x.values_f64();
        let w = self.weight.data().values_f64();
        let b = self.bias.as_ref().map(|bias| bias.data().values_f64());

        let mut out = vec![0.0; batch * n_out];
        for row in 0..batch {
            for o in 0..n_out {
                let mut acc = b.as_ref().map_or(0.0, |b| b[o]);
                for i in 0..n_in {
                    acc += xs[row * n_in + i] * w[o * n_in + i];
                }
                out[row * n_out + o] = acc;
            }
        }
        let shape = if squeeze {
            vec![n_out]
        } else {
            vec![batch, n_out]
        };
        Ok(Value::from(DenseTensor::from_values(out, shape, x.dtype())?))
    }

    fn parameters(&self) -> Vec<(String, Parameter)> {
        let mut params = vec![("weight".to_string(), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias.clone()));
        }
        params
    }
}

macro_rules! activation {
    ($(#[$doc:meta])* $name:ident, $label:literal, $op:expr) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name {
            base: ModuleBase,
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Module for $name {
            fn base(&self) -> &ModuleBase {
                &self.base
            }

            fn class_name(&self) -> String {
                concat!($label, "()").to_string()
            }

            fn forward(&self, input: Value) -> Result<Value, NnError> {
                let x = expect_tensor($label, &input)?;
                Ok(Value::from(x.map($op)))
            }
        }
    };
}

activation!(
    /// ReLU activation module.
    ReLU,
    "ReLU",
    |value: f64| value.max(0.0)
);
activation!(
    /// Tanh activation module.
    Tanh,
    "Tanh",
    f64::tanh
);
activation!(
    /// Sigmoid activation module.
    Sigmoid,
    "Sigmoid",
    |value: f64| 1.0 / (1.0 + (-value).exp())
);

/// Sequential container: chains named children in insertion order.
#[derive(Default)]
pub struct Sequential {
    base: ModuleBase,
    children: Vec<(String, Box<dyn Module>)>,
}

impl Sequential {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `module` named after its position.
    pub fn push(&mut self, module: Box<dyn Module>) {
        let name = self.children.len().to_string();
        self.children.push((name, module));
    }

    pub fn add_module(&mut self, name: impl Into<String>, module: Box<dyn Module>) {
        self.children.push((name.into(), module));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl Module for Sequential {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn class_name(&self) -> String {
        "Sequential".to_string()
    }

    fn forward(&self, input: Value) -> Result<Value, NnError> {
        let mut current = input;
        for (_, module) in &self.children {
            current = module.call(current)?;
        }
        Ok(current)
    }

    fn named_children(&self) -> Vec<(String, &dyn Module)> {
        self.children
            .iter()
            .map(|(name, module)| (name.clone(), module.as_ref()))
            .collect()
    }

    fn is_container(&self) -> bool {
        true
    }
}
