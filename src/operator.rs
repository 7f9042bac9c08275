//! Operator descriptors and the operator registry.
//!
//! An operator declares typed outputs, typed parameters (bound to channels
//! by name) and an optional argument mapping that may read a parameter's
//! channel as a keyed sequence. Its body is either a per-element core,
//! which the engine runs across broadcast inputs, or a whole-array
//! `evaluate` that iterates on its own.

use crate::data::{DataType, TextureEntry};
use crate::error::{XflowError, XflowResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How an argument reads a keyed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceAccess {
    /// First entry, key ignored.
    #[default]
    NoAccess,
    /// Last entry at or before the key.
    PrevBuffer,
    /// First entry at or after the key.
    NextBuffer,
    /// Interpolation weight between the bracketing entries.
    LinearWeight,
}

/// Read-only view of one operator argument.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// Float scalars.
    Float(&'a [f32]),
    /// Integer scalars.
    Int(&'a [i32]),
    /// Booleans.
    Bool(&'a [bool]),
    /// Texture.
    Texture(&'a TextureEntry),
    /// Optional parameter with nothing bound.
    Absent,
}

impl<'a> Arg<'a> {
    /// Float values, empty for other kinds.
    pub fn floats(&self) -> &'a [f32] {
        match *self {
            Arg::Float(v) => v,
            _ => &[],
        }
    }

    /// Integer values, empty for other kinds.
    pub fn ints(&self) -> &'a [i32] {
        match *self {
            Arg::Int(v) => v,
            _ => &[],
        }
    }

    /// Booleans, empty for other kinds.
    pub fn bools(&self) -> &'a [bool] {
        match *self {
            Arg::Bool(v) => v,
            _ => &[],
        }
    }

    /// Texture, if this is one.
    pub fn texture(&self) -> Option<&'a TextureEntry> {
        match *self {
            Arg::Texture(t) => Some(t),
            _ => None,
        }
    }

    /// Nothing bound.
    pub fn is_absent(&self) -> bool {
        matches!(self, Arg::Absent)
    }

    /// Number of scalars.
    pub fn len(&self) -> usize {
        match *self {
            Arg::Float(v) => v.len(),
            Arg::Int(v) => v.len(),
            Arg::Bool(v) => v.len(),
            Arg::Texture(_) => 1,
            Arg::Absent => 0,
        }
    }

    /// No scalars.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn window(&self, start: usize, len: usize) -> Arg<'a> {
        fn cut<T>(v: &[T], start: usize, len: usize) -> &[T] {
            v.get(start..start + len).unwrap_or(&[])
        }
        match *self {
            Arg::Float(v) => Arg::Float(cut(v, start, len)),
            Arg::Int(v) => Arg::Int(cut(v, start, len)),
            Arg::Bool(v) => Arg::Bool(cut(v, start, len)),
            other => other,
        }
    }
}

/// Writable view of one operator output.
#[derive(Debug)]
pub enum OutArg<'a> {
    /// Float scalars.
    Float(&'a mut [f32]),
    /// Integer scalars.
    Int(&'a mut [i32]),
    /// Booleans.
    Bool(&'a mut [bool]),
    /// Texture.
    Texture(&'a mut TextureEntry),
}

impl<'a> OutArg<'a> {
    /// Float values, empty for other kinds.
    pub fn floats(&mut self) -> &mut [f32] {
        match self {
            OutArg::Float(v) => &mut **v,
            _ => &mut [],
        }
    }

    /// Integer values, empty for other kinds.
    pub fn ints(&mut self) -> &mut [i32] {
        match self {
            OutArg::Int(v) => &mut **v,
            _ => &mut [],
        }
    }

    /// Booleans, empty for other kinds.
    pub fn bools(&mut self) -> &mut [bool] {
        match self {
            OutArg::Bool(v) => &mut **v,
            _ => &mut [],
        }
    }

    /// Texture, if this is one.
    pub fn texture(&mut self) -> Option<&mut TextureEntry> {
        match self {
            OutArg::Texture(t) => Some(&mut **t),
            _ => None,
        }
    }

    pub(crate) fn window(&mut self, start: usize, len: usize) -> OutArg<'_> {
        fn cut<T>(v: &mut [T], start: usize, len: usize) -> &mut [T] {
            v.get_mut(start..start + len).unwrap_or_default()
        }
        match self {
            OutArg::Float(v) => OutArg::Float(cut(&mut **v, start, len)),
            OutArg::Int(v) => OutArg::Int(cut(&mut **v, start, len)),
            OutArg::Bool(v) => OutArg::Bool(cut(&mut **v, start, len)),
            OutArg::Texture(t) => OutArg::Texture(&mut **t),
        }
    }
}

/// Facts about the current call handed to whole-array kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalInfo {
    /// Number of iterations implied by the broadcast rule.
    pub iterate_count: usize,
    /// Per argument: whether it advances per iteration.
    pub iterating: Vec<bool>,
}

/// Per-element body. Receives one tuple per output and per iterating argument.
pub type CoreFn = Arc<dyn Fn(&mut [OutArg<'_>], &[Arg<'_>]) + Send + Sync>;

/// Whole-array body; responsible for its own iteration.
pub type EvaluateFn =
    Arc<dyn Fn(&mut [OutArg<'_>], &[Arg<'_>], &EvalInfo) -> Result<(), &'static str> + Send + Sync>;

/// Computes output sizes (in scalars) for outputs declared with custom allocation.
pub type AllocFn = Arc<dyn Fn(&[Arg<'_>], usize) -> Vec<usize> + Send + Sync>;

/// The executable body of an operator.
#[derive(Clone)]
pub enum Kernel {
    /// Per-element core run by the engine's broadcast loop.
    Core(CoreFn),
    /// Whole-array evaluation.
    Evaluate(EvaluateFn),
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Core(_) => write!(f, "Core"),
            Kernel::Evaluate(_) => write!(f, "Evaluate"),
        }
    }
}

/// Output declaration as written by the operator author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    /// Type name, e.g. `float3`.
    pub ty: String,
    /// Declared output name.
    pub name: String,
    /// Size comes from the operator's `alloc` callback.
    pub custom_alloc: bool,
}

/// Parameter declaration as written by the operator author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    /// Type name.
    pub ty: String,
    /// Default channel name feeding this parameter.
    pub source: String,
    /// May be left unbound.
    pub optional: bool,
    /// Passed whole, never iterated.
    pub array: bool,
}

/// Argument declaration as written by the operator author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingDescriptor {
    /// Parameter source this argument reads.
    pub source: String,
    /// Sequence access mode.
    pub sequence: SequenceAccess,
    /// Parameter source holding the sequence key.
    pub key_source: Option<String>,
    /// Passed whole, never iterated.
    pub array: bool,
}

/// Everything needed to register an operator.
#[derive(Clone, Default)]
pub struct OperatorDescriptor {
    /// Outputs.
    pub outputs: Vec<OutputDescriptor>,
    /// Parameters.
    pub params: Vec<ParamDescriptor>,
    /// Arguments; defaults to one argument per parameter.
    pub mapping: Option<Vec<MappingDescriptor>>,
    /// Custom output allocation.
    pub alloc: Option<AllocFn>,
    /// Whole-array body.
    pub evaluate: Option<EvaluateFn>,
    /// Per-element body. Preferred over `evaluate` when both are present.
    pub evaluate_core: Option<CoreFn>,
}

impl fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("outputs", &self.outputs)
            .field("params", &self.params)
            .field("mapping", &self.mapping)
            .field("alloc", &self.alloc.is_some())
            .field("evaluate", &self.evaluate.is_some())
            .field("evaluate_core", &self.evaluate_core.is_some())
            .finish()
    }
}

impl OperatorDescriptor {
    /// Empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output.
    pub fn output(mut self, ty: &str, name: &str) -> Self {
        self.outputs.push(OutputDescriptor {
            ty: ty.to_string(),
            name: name.to_string(),
            custom_alloc: false,
        });
        self
    }

    /// Add an output sized by the `alloc` callback.
    pub fn custom_output(mut self, ty: &str, name: &str) -> Self {
        self.outputs.push(OutputDescriptor {
            ty: ty.to_string(),
            name: name.to_string(),
            custom_alloc: true,
        });
        self
    }

    fn push_param(mut self, ty: &str, source: &str, optional: bool, array: bool) -> Self {
        self.params.push(ParamDescriptor {
            ty: ty.to_string(),
            source: source.to_string(),
            optional,
            array,
        });
        self
    }

    /// Add a required parameter.
    pub fn param(self, ty: &str, source: &str) -> Self {
        self.push_param(ty, source, false, false)
    }

    /// Add an optional parameter.
    pub fn optional_param(self, ty: &str, source: &str) -> Self {
        self.push_param(ty, source, true, false)
    }

    /// Add a parameter passed whole.
    pub fn array_param(self, ty: &str, source: &str) -> Self {
        self.push_param(ty, source, false, true)
    }

    /// Add a plain argument reading `source`.
    pub fn arg(mut self, source: &str) -> Self {
        self.mapping.get_or_insert_with(Vec::new).push(MappingDescriptor {
            source: source.to_string(),
            sequence: SequenceAccess::NoAccess,
            key_source: None,
            array: false,
        });
        self
    }

    /// Add an argument reading `source` as a sequence keyed by `key_source`.
    pub fn sequence_arg(mut self, source: &str, access: SequenceAccess, key_source: &str) -> Self {
        self.mapping.get_or_insert_with(Vec::new).push(MappingDescriptor {
            source: source.to_string(),
            sequence: access,
            key_source: Some(key_source.to_string()),
            array: false,
        });
        self
    }

    /// Set the custom allocation callback.
    pub fn alloc<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Arg<'_>], usize) -> Vec<usize> + Send + Sync + 'static,
    {
        self.alloc = Some(Arc::new(f));
        self
    }

    /// Set the per-element body.
    pub fn core<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut [OutArg<'_>], &[Arg<'_>]) + Send + Sync + 'static,
    {
        self.evaluate_core = Some(Arc::new(f));
        self
    }

    /// Set the whole-array body.
    pub fn evaluate<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut [OutArg<'_>], &[Arg<'_>], &EvalInfo) -> Result<(), &'static str>
            + Send
            + Sync
            + 'static,
    {
        self.evaluate = Some(Arc::new(f));
        self
    }
}

/// A validated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDecl {
    /// Output type.
    pub ty: DataType,
    /// Declared name.
    pub name: String,
    /// Sized by the `alloc` callback.
    pub custom_alloc: bool,
}

/// A validated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    /// Parameter type.
    pub ty: DataType,
    /// Default channel name.
    pub source: String,
    /// May be left unbound.
    pub optional: bool,
    /// Passed whole.
    pub array: bool,
}

/// A validated argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    /// Index into the operator's parameters.
    pub param: usize,
    /// Sequence access mode.
    pub sequence: SequenceAccess,
    /// Parameter index holding the sequence key.
    pub key_param: Option<usize>,
    /// Passed whole.
    pub array: bool,
}

/// A registered operator.
pub struct Operator {
    name: String,
    outputs: Vec<OutputDecl>,
    params: Vec<ParamDecl>,
    args: Vec<ArgDecl>,
    alloc: Option<AllocFn>,
    kernel: Kernel,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .field("params", &self.params)
            .field("args", &self.args)
            .field("kernel", &self.kernel)
            .finish()
    }
}

impl Operator {
    /// Validate a descriptor into an operator.
    pub fn from_descriptor(name: &str, desc: OperatorDescriptor) -> XflowResult<Self> {
        let invalid = |reason: String| XflowError::invalid_operator(name, reason);

        if desc.outputs.is_empty() {
            return Err(invalid("no outputs declared".into()));
        }
        let outputs = desc
            .outputs
            .iter()
            .map(|o| {
                Ok(OutputDecl {
                    ty: o.ty.parse()?,
                    name: o.name.clone(),
                    custom_alloc: o.custom_alloc,
                })
            })
            .collect::<XflowResult<Vec<_>>>()?;
        let params = desc
            .params
            .iter()
            .map(|p| {
                Ok(ParamDecl {
                    ty: p.ty.parse()?,
                    source: p.source.clone(),
                    optional: p.optional,
                    array: p.array,
                })
            })
            .collect::<XflowResult<Vec<_>>>()?;

        let param_index = |source: &str| params.iter().position(|p| p.source == source);
        let args = match &desc.mapping {
            None => (0..params.len())
                .map(|i| ArgDecl {
                    param: i,
                    sequence: SequenceAccess::NoAccess,
                    key_param: None,
                    array: params[i].array,
                })
                .collect(),
            Some(mapping) => {
                let mut args = Vec::with_capacity(mapping.len());
                for m in mapping {
                    let param = param_index(&m.source)
                        .ok_or_else(|| invalid(format!("mapping source '{}' is not a param", m.source)))?;
                    let key_param = match (&m.key_source, m.sequence) {
                        (_, SequenceAccess::NoAccess) => None,
                        (Some(key), _) => Some(param_index(key).ok_or_else(|| {
                            invalid(format!("key source '{key}' is not a param"))
                        })?),
                        (None, _) => {
                            return Err(invalid(format!(
                                "sequence argument '{}' needs a key source",
                                m.source
                            )))
                        }
                    };
                    args.push(ArgDecl {
                        param,
                        sequence: m.sequence,
                        key_param,
                        array: m.array || params[param].array,
                    });
                }
                args
            }
        };

        if outputs.iter().any(|o| o.custom_alloc) && desc.alloc.is_none() {
            return Err(invalid("custom allocation declared without alloc".into()));
        }
        let kernel = match (desc.evaluate_core, desc.evaluate) {
            (Some(core), _) => {
                if outputs.iter().any(|o| o.ty == DataType::Texture) {
                    return Err(invalid("texture outputs need a whole-array evaluate".into()));
                }
                Kernel::Core(core)
            }
            (None, Some(evaluate)) => Kernel::Evaluate(evaluate),
            (None, None) => return Err(invalid("neither evaluate nor evaluate_core given".into())),
        };

        Ok(Self {
            name: name.to_string(),
            outputs,
            params,
            args,
            alloc: desc.alloc,
            kernel,
        })
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outputs.
    pub fn outputs(&self) -> &[OutputDecl] {
        &self.outputs
    }

    /// Parameters.
    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    /// Arguments passed to the kernel, in order.
    pub fn args(&self) -> &[ArgDecl] {
        &self.args
    }

    /// Kernel.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub(crate) fn alloc_fn(&self) -> Option<&AllocFn> {
        self.alloc.as_ref()
    }

    /// Type seen by the kernel for argument `index`.
    pub fn arg_type(&self, index: usize) -> DataType {
        let arg = &self.args[index];
        match arg.sequence {
            SequenceAccess::LinearWeight => DataType::Float,
            _ => self.params[arg.param].ty,
        }
    }
}

/// Name-indexed set of operators, built once and shared into graphs.
#[derive(Debug, Default, Clone)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<Operator>>,
}

impl OperatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `xflow.*` operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::ops::register_builtins(&mut registry);
        registry
    }

    /// Validate and register an operator, replacing any previous one with the same name.
    pub fn register(&mut self, name: &str, desc: OperatorDescriptor) -> XflowResult<()> {
        let op = Operator::from_descriptor(name, desc)?;
        if self.operators.insert(name.to_string(), Arc::new(op)).is_some() {
            tracing::warn!(operator = name, "operator re-registered, replacing previous definition");
        }
        Ok(())
    }

    /// Look up an operator.
    pub fn get(&self, name: &str) -> Option<Arc<Operator>> {
        self.operators.get(name).cloned()
    }

    /// Whether an operator is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
