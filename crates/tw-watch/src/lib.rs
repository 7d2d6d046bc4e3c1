#![forbid(unsafe_code)]

//! Instrumentation of a training loop: periodic histograms of parameters and
//! gradients, and a one-shot computation graph per watched model.
//!
//! Hooks never commit rows themselves. Every histogram is merged into the
//! sink's pending row and lands in history with the host's next committed
//! log call.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};
use tw_core::{DenseTensor, Value};
use tw_graph::{CompletionHook, GraphHandle, TorchGraph};
use tw_histogram::{
    DEFAULT_NUM_BINS, HistogramRecord, summarize, summarize_many, summarize_with_implicit_zeros,
};
use tw_nn::{HookHandle, Module, ModuleId, NnError, Parameter, named_parameters};
use tw_shape::collect_tensors;

pub const DEFAULT_LOG_FREQ: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("{model} is already watched; unwatch it or watch a new instance")]
    AlreadyWatched { model: ModuleId },
    #[error("a hook named {name:?} is already registered")]
    DuplicateHook { name: String },
    #[error("invalid watch configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("log must be one of \"gradients\", \"parameters\", \"all\" or null, got {value:?}")]
    InvalidLogMode { value: String },
    #[error(transparent)]
    Nn(#[from] NnError),
}

/// Which tensors a watch turns into histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    #[default]
    Gradients,
    Parameters,
    All,
    None,
}

impl LogMode {
    #[must_use]
    pub fn logs_gradients(self) -> bool {
        matches!(self, Self::Gradients | Self::All)
    }

    #[must_use]
    pub fn logs_parameters(self) -> bool {
        matches!(self, Self::Parameters | Self::All)
    }

    #[must_use]
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Gradients => Some("gradients"),
            Self::Parameters => Some("parameters"),
            Self::All => Some("all"),
            Self::None => None,
        }
    }
}

impl FromStr for LogMode {
    type Err = WatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gradients" => Ok(Self::Gradients),
            "parameters" => Ok(Self::Parameters),
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            other => Err(WatchError::InvalidLogMode {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("none"))
    }
}

impl Serialize for LogMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_str() {
            Some(mode) => serializer.serialize_str(mode),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for LogMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(mode) => mode.parse().map_err(de::Error::custom),
            None => Ok(Self::None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub log: LogMode,
    /// Histograms are taken on every `log_freq`-th forward or gradient.
    pub log_freq: u64,
    pub log_graph: bool,
    /// First watch index to use; defaults to the session's running counter.
    pub idx: Option<usize>,
    pub num_bins: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            log: LogMode::default(),
            log_freq: DEFAULT_LOG_FREQ,
            log_graph: false,
            idx: None,
            num_bins: DEFAULT_NUM_BINS,
        }
    }
}

impl WatchConfig {
    /// Parses and validates a JSON object; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, WatchError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| WatchError::InvalidConfig {
                reason: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if self.log_freq == 0 {
            return Err(WatchError::InvalidConfig {
                reason: "log_freq must be positive".to_string(),
            });
        }
        if self.num_bins == 0 {
            return Err(WatchError::InvalidConfig {
                reason: "num_bins must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Counter that fires on every `threshold`-th update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTrack {
    count: u64,
    threshold: u64,
}

impl LogTrack {
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Counts one event; returns true and resets when the threshold is reached.
    pub fn update(&mut self) -> bool {
        self.count += 1;
        if self.count < self.threshold {
            return false;
        }
        self.count = 0;
        true
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

pub type LogRow = BTreeMap<String, serde_json::Value>;

/// Destination of metric rows and run summary values.
pub trait MetricSink {
    /// Merges `row` into the pending row; `commit` closes the row.
    fn log(&mut self, row: LogRow, commit: bool);

    fn set_summary(&mut self, key: &str, value: serde_json::Value);
}

pub type SharedSink = Rc<RefCell<dyn MetricSink>>;

/// In-memory [`MetricSink`] keeping every committed row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    rows: Vec<LogRow>,
    pending: LogRow,
    summary: BTreeMap<String, serde_json::Value>,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> &[LogRow] {
        &self.rows
    }

    #[must_use]
    pub fn pending(&self) -> &LogRow {
        &self.pending
    }

    #[must_use]
    pub fn summary(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.summary
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl MetricSink for History {
    fn log(&mut self, row: LogRow, commit: bool) {
        self.pending.extend(row);
        if commit {
            let mut row = std::mem::take(&mut self.pending);
            row.insert("_step".to_string(), serde_json::Value::from(self.rows.len()));
            self.rows.push(row);
        }
    }

    fn set_summary(&mut self, key: &str, value: serde_json::Value) {
        self.summary.insert(key.to_string(), value);
    }
}

/// Summarizes tensors into histogram rows for a sink.
#[derive(Clone)]
pub struct HistogramLogger {
    sink: SharedSink,
    num_bins: usize,
}

impl HistogramLogger {
    #[must_use]
    pub fn new(sink: SharedSink, num_bins: usize) -> Self {
        Self { sink, num_bins }
    }

    /// Merges the histogram of `value` under `name` into the pending row.
    ///
    /// Nested lists are flattened and their tensors summarized together.
    /// Returns false when nothing was logged.
    pub fn log_tensor_stats(&self, value: &Value, name: &str) -> bool {
        match value {
            Value::Tensor(tensor) => self.log_tensor(tensor, name),
            Value::List(_) => {
                let tensors = collect_tensors(value);
                match summarize_many(&tensors, self.num_bins) {
                    Ok(record) => self.log_record(record, name),
                    Err(err) => {
                        debug!(key = name, %err, "no tensors to summarize");
                        false
                    }
                }
            }
            _ => {
                debug!(key = name, kind = ?value.kind(), "not a tensor, histogram skipped");
                false
            }
        }
    }

    /// Logs a sparse tensor given its stored entries and dense element count.
    /// Entries that are not stored count as zeros.
    pub fn log_sparse_stats(&self, values: &DenseTensor, dense_numel: usize, name: &str) -> bool {
        let implicit_zeros = dense_numel.saturating_sub(values.numel()) as u64;
        let record = summarize_with_implicit_zeros(values, implicit_zeros, self.num_bins);
        self.log_record(record, name)
    }

    fn log_tensor(&self, tensor: &DenseTensor, name: &str) -> bool {
        self.log_record(summarize(tensor, self.num_bins), name)
    }

    fn log_record(&self, record: Option<HistogramRecord>, name: &str) -> bool {
        let Some(record) = record else {
            debug!(key = name, "no finite values, histogram skipped");
            return false;
        };
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = name, %err, "histogram could not be encoded");
                return false;
            }
        };
        let Ok(mut sink) = self.sink.try_borrow_mut() else {
            warn!(key = name, "metric sink is borrowed, histogram dropped");
            return false;
        };
        sink.log(LogRow::from([(name.to_string(), value)]), false);
        true
    }
}

#[derive(Default)]
struct Registration {
    hooks: Vec<HookHandle>,
    names: Vec<String>,
    graph: Option<GraphHandle>,
}

/// A watch session bound to one metric sink.
pub struct Watcher {
    sink: SharedSink,
    next_idx: usize,
    hook_names: HashSet<String>,
    registrations: HashMap<ModuleId, Registration>,
}

impl Watcher {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            next_idx: 0,
            hook_names: HashSet::new(),
            registrations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    #[must_use]
    pub fn is_watched(&self, model: &dyn Module) -> bool {
        self.registrations.contains_key(&model.id())
    }

    /// Registered hook names, sorted.
    #[must_use]
    pub fn hook_names(&self) -> Vec<String> {
        let mut names = self.hook_names.iter().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Hooks `models` for histogram logging and, with `log_graph`, graph
    /// extraction. Returns one graph handle per model when `log_graph` is set.
    ///
    /// Nothing is registered if any model fails validation.
    pub fn watch(
        &mut self,
        models: &[&dyn Module],
        config: &WatchConfig,
    ) -> Result<Vec<GraphHandle>, WatchError> {
        config.validate()?;
        let first_idx = config.idx.unwrap_or(self.next_idx);

        let mut claimed = HashSet::new();
        let mut graphed = HashSet::new();
        let mut plans = Vec::with_capacity(models.len());
        for (local_idx, model) in models.iter().enumerate() {
            let graph_idx = first_idx + local_idx;
            let plan = WatchPlan::new(*model, graph_idx, config);
            let graph_taken = self
                .registrations
                .get(&model.id())
                .is_some_and(|registration| registration.graph.is_some());
            if config.log_graph && (graph_taken || !graphed.insert(model.id())) {
                return Err(WatchError::AlreadyWatched { model: model.id() });
            }
            for name in plan.hook_names() {
                if self.hook_names.contains(&name) || !claimed.insert(name.clone()) {
                    return Err(WatchError::DuplicateHook { name });
                }
            }
            plans.push(plan);
        }

        let mut graphs = Vec::new();
        for (model, plan) in models.iter().zip(plans) {
            self.next_idx += 1;
            let logger = HistogramLogger::new(Rc::clone(&self.sink), config.num_bins);
            let publisher = self.graph_publisher();
            let registration = self.registrations.entry(model.id()).or_default();
            plan.install(*model, &logger, config, registration)?;
            if config.log_graph {
                let graph = TorchGraph::shared(plan.graph_idx);
                let hooks = TorchGraph::hook_modules(&graph, *model, Some(publisher));
                registration.hooks.extend(hooks);
                registration.graph = Some(Rc::clone(&graph));
                graphs.push(graph);
            }
            self.hook_names.extend(registration.names.iter().cloned());
            debug!(
                model = %model.id(),
                graph_idx = plan.graph_idx,
                log = %config.log,
                log_freq = config.log_freq,
                "model watched"
            );
        }
        Ok(graphs)
    }

    fn graph_publisher(&self) -> CompletionHook {
        let sink = Rc::clone(&self.sink);
        Rc::new(move |graph: &TorchGraph| {
            let json = match graph.to_graph_json() {
                Ok(json) => json,
                Err(err) => {
                    warn!(graph_idx = graph.graph_idx(), %err, "graph could not be encoded");
                    return;
                }
            };
            match sink.try_borrow_mut() {
                Ok(mut sink) => sink.set_summary(&graph.summary_key(), json),
                Err(_) => warn!(
                    graph_idx = graph.graph_idx(),
                    "metric sink is borrowed, graph dropped"
                ),
            }
        })
    }

    /// Removes every hook registered for `models`.
    pub fn unwatch(&mut self, models: &[&dyn Module]) {
        for model in models {
            match self.registrations.remove(&model.id()) {
                Some(registration) => self.release(model.id(), registration),
                None => warn!(model = %model.id(), "model is not watched, nothing to unwatch"),
            }
        }
    }

    pub fn unwatch_all(&mut self) {
        let registrations = std::mem::take(&mut self.registrations);
        for (model, registration) in registrations {
            self.release(model, registration);
        }
    }

    fn release(&mut self, model: ModuleId, registration: Registration) {
        for hook in &registration.hooks {
            hook.remove();
        }
        for name in &registration.names {
            self.hook_names.remove(name);
        }
        debug!(model = %model, hooks = registration.hooks.len(), "model unwatched");
    }

    fn default_logger(&self) -> HistogramLogger {
        HistogramLogger::new(Rc::clone(&self.sink), DEFAULT_NUM_BINS)
    }

    /// Logs one histogram with the default bin count, outside any hook.
    pub fn log_tensor_stats(&self, value: &Value, name: &str) -> bool {
        self.default_logger().log_tensor_stats(value, name)
    }

    /// [`HistogramLogger::log_sparse_stats`] with the default bin count.
    pub fn log_sparse_stats(&self, values: &DenseTensor, dense_numel: usize, name: &str) -> bool {
        self.default_logger().log_sparse_stats(values, dense_numel, name)
    }
}

/// Hook names and targets computed for one model before anything is installed.
struct WatchPlan {
    graph_idx: usize,
    prefix: String,
    log_parameters: bool,
    gradients: Vec<(String, Parameter)>,
}

impl WatchPlan {
    fn new(model: &dyn Module, graph_idx: usize, config: &WatchConfig) -> Self {
        let prefix = if graph_idx > 0 {
            format!("graph_{graph_idx}")
        } else {
            String::new()
        };
        let gradients = if config.log.logs_gradients() {
            named_parameters(model)
                .into_iter()
                .filter(|(_, parameter)| parameter.requires_grad())
                .map(|(name, parameter)| (format!("gradients/{prefix}{name}"), parameter))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            graph_idx,
            prefix,
            log_parameters: config.log.logs_parameters(),
            gradients,
        }
    }

    fn parameters_hook_name(&self) -> String {
        format!("parameters/{}", self.prefix)
    }

    fn hook_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.gradients.len() + 1);
        if self.log_parameters {
            names.push(self.parameters_hook_name());
        }
        names.extend(self.gradients.iter().map(|(name, _)| name.clone()));
        names
    }

    fn install(
        &self,
        model: &dyn Module,
        logger: &HistogramLogger,
        config: &WatchConfig,
        registration: &mut Registration,
    ) -> Result<(), WatchError> {
        if self.log_parameters {
            let parameters = named_parameters(model)
                .into_iter()
                .map(|(name, parameter)| (format!("parameters/{}{name}", self.prefix), parameter))
                .collect::<Vec<_>>();
            let logger = logger.clone();
            let track = Cell::new(LogTrack::new(config.log_freq));
            let handle = model.base().register_forward_hook(move |_| {
                let mut state = track.get();
                let fire = state.update();
                track.set(state);
                if !fire {
                    return;
                }
                for (name, parameter) in &parameters {
                    logger.log_tensor(&parameter.data(), name);
                }
            });
            registration.hooks.push(handle);
            registration.names.push(self.parameters_hook_name());
        }

        for (name, parameter) in &self.gradients {
            let logger = logger.clone();
            let track = Cell::new(LogTrack::new(config.log_freq));
            let key = name.clone();
            let handle = parameter.register_grad_hook(move |grad| {
                let mut state = track.get();
                let fire = state.update();
                track.set(state);
                if fire {
                    logger.log_tensor(grad, &key);
                }
            })?;
            registration.hooks.push(handle);
            registration.names.push(name.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use proptest::prelude::*;
    use tw_core::{DType, DenseTensor, Value};
    use tw_nn::{Linear, Module, ReLU, Sequential};

    use super::{
        History, LogMode, LogRow, LogTrack, MetricSink, WatchConfig, WatchError, Watcher,
    };

    fn linear(inputs: usize, outputs: usize) -> Linear {
        Linear::from_tensors(
            DenseTensor::full(vec![outputs, inputs], 0.5, DType::F32),
            Some(DenseTensor::zeros(vec![outputs], DType::F32)),
        )
        .expect("linear should build")
    }

    fn session() -> (Watcher, Rc<RefCell<History>>) {
        let history = Rc::new(RefCell::new(History::new()));
        (Watcher::new(history.clone()), history)
    }

    fn commit(history: &Rc<RefCell<History>>) {
        history.borrow_mut().log(LogRow::new(), true);
    }

    #[test]
    fn log_mode_parses_known_names() {
        assert_eq!("gradients".parse::<LogMode>(), Ok(LogMode::Gradients));
        assert_eq!("parameters".parse::<LogMode>(), Ok(LogMode::Parameters));
        assert_eq!("all".parse::<LogMode>(), Ok(LogMode::All));
        assert_eq!(
            "weights".parse::<LogMode>(),
            Err(WatchError::InvalidLogMode {
                value: "weights".to_string(),
            })
        );
        assert!(LogMode::All.logs_gradients() && LogMode::All.logs_parameters());
        assert!(!LogMode::None.logs_gradients() && !LogMode::None.logs_parameters());
    }

    #[test]
    fn config_defaults_and_json() {
        let config = WatchConfig::default();
        assert_eq!(config.log, LogMode::Gradients);
        assert_eq!(config.log_freq, 1000);
        assert!(!config.log_graph);
        assert_eq!(config.idx, None);
        assert_eq!(config.num_bins, 64);

        let config = WatchConfig::from_json(r#"{"log": "all", "log_freq": 1, "log_graph": true}"#)
            .expect("config should parse");
        assert_eq!(config.log, LogMode::All);
        assert_eq!(config.log_freq, 1);
        assert!(config.log_graph);
        assert_eq!(config.num_bins, 64);

        let config = WatchConfig::from_json(r#"{"log": null}"#).expect("null log is allowed");
        assert_eq!(config.log, LogMode::None);

        let encoded = serde_json::to_value(&config).expect("config should encode");
        assert!(encoded["log"].is_null());

        assert!(matches!(
            WatchConfig::from_json(r#"{"log": "weights"}"#),
            Err(WatchError::InvalidConfig { .. })
        ));
        assert!(matches!(
            WatchConfig::from_json(r#"{"log_freq": 0}"#),
            Err(WatchError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn log_track_fires_on_threshold() {
        let mut track = LogTrack::new(3);
        let fired = (0..7).map(|_| track.update()).collect::<Vec<_>>();
        assert_eq!(fired, [false, false, true, false, false, true, false]);
        assert_eq!(track.count(), 1);
    }

    #[test]
    fn history_merges_uncommitted_rows() {
        let mut history = History::new();
        history.log(LogRow::from([("a".to_string(), 1.into())]), false);
        history.log(LogRow::from([("b".to_string(), 2.into())]), false);
        assert!(history.is_empty());
        history.log(LogRow::from([("c".to_string(), 3.into())]), true);
        history.log(LogRow::new(), true);

        assert_eq!(history.len(), 2);
        let first = &history.rows()[0];
        assert_eq!(first.keys().collect::<Vec<_>>(), ["_step", "a", "b", "c"]);
        assert_eq!(first["_step"], 0);
        assert_eq!(history.rows()[1]["_step"], 1);
        assert!(history.pending().is_empty());
    }

    #[test]
    fn log_tensor_stats_merges_without_committing() {
        let (watcher, history) = session();
        let tensor = DenseTensor::from_f32(vec![1.0, f32::NAN, f32::INFINITY], vec![3])
            .expect("tensor");
        assert!(watcher.log_tensor_stats(&Value::from(tensor), "weights"));
        let empty = DenseTensor::from_f32(vec![f32::NAN, f32::NAN], vec![2]).expect("tensor");
        assert!(!watcher.log_tensor_stats(&Value::from(empty), "nothing"));

        assert!(history.borrow().is_empty());
        let pending = history.borrow().pending().clone();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["weights"]["_type"], "histogram");
        assert_eq!(pending["weights"]["bins"].as_array().map(Vec::len), Some(65));
        assert_eq!(pending["weights"]["values"].as_array().map(Vec::len), Some(64));
    }

    fn counts(row: &LogRow, key: &str) -> Vec<u64> {
        row[key]["values"]
            .as_array()
            .expect("bin counts")
            .iter()
            .filter_map(serde_json::Value::as_u64)
            .collect()
    }

    #[test]
    fn lists_are_flattened_into_one_histogram() {
        let (watcher, history) = session();
        let first = DenseTensor::from_f32(vec![1.0, 2.0], vec![2]).expect("tensor");
        let second = DenseTensor::from_f64(vec![3.0, f64::NAN, 4.0], vec![3]).expect("tensor");
        let nested = Value::list([
            Value::from(first),
            Value::list([Value::from(second), Value::Scalar(7.0)]),
        ]);
        assert!(watcher.log_tensor_stats(&nested, "outputs"));

        assert!(!watcher.log_tensor_stats(&Value::list([Value::Scalar(1.0)]), "scalars"));
        assert!(!watcher.log_tensor_stats(&Value::Scalar(1.0), "scalar"));

        let pending = history.borrow().pending().clone();
        assert_eq!(pending.keys().collect::<Vec<_>>(), ["outputs"]);
        let bins = counts(&pending, "outputs");
        assert_eq!(bins.len(), 64);
        assert_eq!(bins.iter().sum::<u64>(), 4);
        assert_eq!(pending["outputs"]["bins"][0], 1.0);
        assert_eq!(pending["outputs"]["bins"][64], 4.0);
    }

    #[test]
    fn sparse_stats_count_missing_entries_as_zeros() {
        let (watcher, history) = session();
        let stored = DenseTensor::from_f32(vec![2.0, 4.0], vec![2]).expect("tensor");
        assert!(watcher.log_sparse_stats(&stored, 10, "embedding"));

        let pending = history.borrow().pending().clone();
        let bins = counts(&pending, "embedding");
        assert_eq!(bins.iter().sum::<u64>(), 10);
        assert_eq!(bins[0], 8);
        assert_eq!(bins[63], 1);
        assert_eq!(pending["embedding"]["bins"][0], 0.0);
    }

    #[test]
    fn invalid_config_registers_nothing() {
        let (mut watcher, _) = session();
        let model = linear(2, 2);
        let config = WatchConfig {
            num_bins: 0,
            ..WatchConfig::default()
        };
        assert!(matches!(
            watcher.watch(&[&model], &config),
            Err(WatchError::InvalidConfig { .. })
        ));
        assert!(!watcher.is_watched(&model));
        assert_eq!(model.weight().grad_hook_count(), 0);
    }

    #[test]
    fn gradient_hooks_are_named_and_unique() {
        let (mut watcher, _) = session();
        let model = linear(2, 3);
        watcher
            .watch(&[&model], &WatchConfig::default())
            .expect("first watch should succeed");
        assert_eq!(
            watcher.hook_names(),
            ["gradients/bias", "gradients/weight"]
        );

        let err = watcher
            .watch(&[&model], &WatchConfig::default())
            .expect_err("second gradient watch must fail");
        assert!(matches!(err, WatchError::DuplicateHook { .. }));
        assert_eq!(model.weight().grad_hook_count(), 1);

        watcher.unwatch(&[&model]);
        assert!(watcher.hook_names().is_empty());
        assert_eq!(model.weight().grad_hook_count(), 0);
        watcher
            .watch(&[&model], &WatchConfig::default())
            .expect("watch after unwatch should succeed");
    }

    #[test]
    fn watching_a_graph_twice_fails() {
        let (mut watcher, _) = session();
        let mut model = Sequential::new();
        model.push(Box::new(linear(2, 2)));
        let config = WatchConfig {
            log: LogMode::None,
            log_graph: true,
            ..WatchConfig::default()
        };
        watcher
            .watch(&[&model], &config)
            .expect("first watch should succeed");
        assert_eq!(
            watcher.watch(&[&model], &config).map(|graphs| graphs.len()),
            Err(WatchError::AlreadyWatched { model: model.id() })
        );

        watcher.unwatch_all();
        assert!(!watcher.is_watched(&model));
        assert_eq!(
            watcher.watch(&[&model], &config).map(|graphs| graphs.len()),
            Ok(1)
        );
    }

    #[test]
    fn parameters_are_logged_every_log_freq_forwards() {
        let (mut watcher, history) = session();
        let mut model = Sequential::new();
        model.push(Box::new(linear(2, 2)));
        model.push(Box::new(ReLU::new()));
        let config = WatchConfig {
            log: LogMode::Parameters,
            log_freq: 2,
            ..WatchConfig::default()
        };
        watcher.watch(&[&model], &config).expect("watch should succeed");
        assert_eq!(watcher.hook_names(), ["parameters/"]);

        let input = Value::from(DenseTensor::ones(vec![1, 2], DType::F32));
        for _ in 0..4 {
            model.call(input.clone()).expect("forward should succeed");
            commit(&history);
        }

        let history = history.borrow();
        let logged = history
            .rows()
            .iter()
            .map(|row| row.contains_key("parameters/0.weight"))
            .collect::<Vec<_>>();
        assert_eq!(logged, [false, true, false, true]);
        assert!(history.rows()[1].contains_key("parameters/0.bias"));
    }

    #[test]
    fn later_models_get_prefixed_names() {
        let (mut watcher, _) = session();
        let (first, second) = (linear(1, 1), linear(1, 1));
        let graphs = watcher
            .watch(&[&first, &second], &WatchConfig::default())
            .expect("watch should succeed");
        assert!(graphs.is_empty());
        assert_eq!(
            watcher.hook_names(),
            [
                "gradients/bias",
                "gradients/graph_1bias",
                "gradients/graph_1weight",
                "gradients/weight",
            ]
        );

        let third = linear(1, 1);
        let config = WatchConfig {
            idx: Some(5),
            ..WatchConfig::default()
        };
        watcher.watch(&[&third], &config).expect("watch should succeed");
        assert!(watcher.hook_names().contains(&"gradients/graph_5weight".to_string()));
    }

    #[test]
    fn unwatching_an_unknown_model_is_harmless() {
        let (mut watcher, _) = session();
        let model = linear(1, 1);
        watcher.unwatch(&[&model]);
        assert!(!watcher.is_watched(&model));
    }

    proptest! {
        #[test]
        fn prop_log_track_fires_once_per_threshold(threshold in 1u64..50, updates in 0u64..500) {
            let mut track = LogTrack::new(threshold);
            let fired = (0..updates).filter(|_| track.update()).count() as u64;
            prop_assert_eq!(fired, updates / threshold);
            prop_assert_eq!(track.count(), updates % threshold);
        }
    }
}
