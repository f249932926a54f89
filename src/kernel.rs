//! Kernel contract: signatures, hooks and the execution-time views handed to kernels.

#![forbid(unsafe_code)]

use crate::config::MAX_PARAMETERS;
use crate::context::Context;
use crate::data::{Buffer, DataObject, Scalar, ScalarType, ScalarValue};
use crate::error::{VxError, VxResult};
use crate::reference::{Counter, Object, Ref, RefType};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Logical identity of a kernel, shared by its implementations on every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel#{:#x}", self.0)
    }
}

/// Data-flow direction of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read by the kernel.
    Input,
    /// Written by the kernel.
    Output,
    /// Read and written by the kernel.
    Bidirectional,
}

impl Direction {
    /// Whether the kernel writes through this parameter.
    pub fn writes(self) -> bool {
        matches!(self, Direction::Output | Direction::Bidirectional)
    }
}

/// Whether a parameter must be bound before verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamState {
    /// Must be bound.
    Required,
    /// May stay unbound.
    Optional,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Exactly this data kind.
    Object(RefType),
    /// A scalar carrying this sub-type.
    Scalar(ScalarType),
    /// Any data object.
    Any,
}

impl ParamType {
    /// Whether a value of `kind` (and scalar sub-type, for scalars) satisfies the declaration.
    pub fn accepts(&self, kind: RefType, scalar: Option<ScalarType>) -> bool {
        match self {
            ParamType::Any => kind.is_data_object(),
            ParamType::Object(declared) => *declared == kind,
            ParamType::Scalar(declared) => kind == RefType::Scalar && scalar == Some(*declared),
        }
    }

    /// Default object bound to a required slot that was explicitly cleared.
    pub(crate) fn placeholder(&self) -> Option<Box<dyn DataObject>> {
        match self {
            ParamType::Scalar(ty) => Some(Box::new(Scalar::new(ScalarValue::zero(*ty)))),
            ParamType::Object(RefType::Scalar) => Some(Box::new(Scalar::new(ScalarValue::U32(0)))),
            ParamType::Object(kind) => Buffer::new(*kind, 0)
                .ok()
                .map(|buffer| Box::new(buffer) as Box<dyn DataObject>),
            ParamType::Any => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Object(kind) => write!(f, "{kind}"),
            ParamType::Scalar(ty) => write!(f, "scalar({ty})"),
            ParamType::Any => f.write_str("any"),
        }
    }
}

/// One entry of a kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDesc {
    /// Data-flow direction.
    pub direction: Direction,
    /// Declared type.
    pub ty: ParamType,
    /// Required or optional.
    pub state: ParamState,
}

impl ParamDesc {
    /// Required input.
    pub const fn input(ty: ParamType) -> Self {
        Self {
            direction: Direction::Input,
            ty,
            state: ParamState::Required,
        }
    }

    /// Required output.
    pub const fn output(ty: ParamType) -> Self {
        Self {
            direction: Direction::Output,
            ty,
            state: ParamState::Required,
        }
    }

    /// Required bidirectional parameter.
    pub const fn bidirectional(ty: ParamType) -> Self {
        Self {
            direction: Direction::Bidirectional,
            ty,
            state: ParamState::Required,
        }
    }

    /// Same parameter, marked optional.
    pub const fn optional(mut self) -> Self {
        self.state = ParamState::Optional;
        self
    }
}

/// How a kernel treats pixels outside its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BorderMode {
    /// Border pixels are unspecified.
    #[default]
    Undefined,
    /// Out-of-range reads return a constant.
    Constant(u32),
    /// Out-of-range reads replicate the edge.
    Replicate,
}

/// Attribute defaults a kernel hands to every node that binds it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KernelAttributes {
    /// Scratch bytes allocated per node at verification.
    pub local_data_size: usize,
    /// Border handling.
    pub border: BorderMode,
    /// Relative cost used for diagnostics.
    pub cost: f32,
}

/// Read-only view handed to validate and initialize hooks.
pub struct ValidateContext<'a> {
    ctx: &'a Context,
    node: Ref,
}

impl<'a> ValidateContext<'a> {
    pub(crate) fn new(ctx: &'a Context, node: Ref) -> Self {
        Self { ctx, node }
    }

    /// Node being verified.
    pub fn node(&self) -> Ref {
        self.node
    }

    /// Owning context.
    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// Kind of a bound value.
    pub fn reference_type(&self, r: Ref) -> VxResult<RefType> {
        self.ctx.reference_type(r)
    }

    /// Metadata access to a bound value, virtual or not.
    pub fn data<T: DataObject>(&self, r: Ref) -> VxResult<&T> {
        let data = self.ctx.data_obj(r)?;
        let kind = data.kind();
        data.as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| VxError::invalid_type(std::any::type_name::<T>(), kind))
    }
}

/// Mutable view handed to a kernel while it executes.
pub struct ExecContext<'a> {
    ctx: &'a mut Context,
    node: Ref,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(ctx: &'a mut Context, node: Ref) -> Self {
        Self { ctx, node }
    }

    /// Node being executed.
    pub fn node(&self) -> Ref {
        self.node
    }

    /// Owning context.
    pub fn context(&self) -> &Context {
        &*self.ctx
    }

    /// Typed read access to a bound value.
    pub fn data<T: DataObject>(&self, r: Ref) -> VxResult<&T> {
        self.ctx.data(r)
    }

    /// Typed write access to a bound value.
    pub fn data_mut<T: DataObject>(&mut self, r: Ref) -> VxResult<&mut T> {
        self.ctx.data_mut(r)
    }

    /// Value of a bound scalar.
    pub fn read_scalar(&self, r: Ref) -> VxResult<ScalarValue> {
        self.ctx.read_scalar(r)
    }

    /// Overwrite a bound scalar.
    pub fn write_scalar(&mut self, r: Ref, value: ScalarValue) -> VxResult<()> {
        self.ctx.write_scalar(r, value)
    }

    /// Scratch memory sized by the node's `local_data_size`, zeroed at verification.
    pub fn local_data_mut(&mut self) -> VxResult<&mut [u8]> {
        Ok(&mut self.ctx.node_obj_mut(self.node)?.local_data)
    }

    /// Run the nested graph attached to this node with `params` bound to its graph
    /// parameters, position by position.
    ///
    /// Slots already holding the same object are left alone so the child stays verified.
    pub fn process_child_graph(&mut self, params: &[Option<Ref>]) -> VxResult<()> {
        let child = self.ctx.child_graph(self.node)?.ok_or_else(|| {
            VxError::InvalidValue(format!("{} has no child graph", self.node))
        })?;
        for (index, value) in params.iter().enumerate() {
            let Some(value) = *value else { continue };
            let (node, slot) = self.ctx.graph_parameter_slot(child, index)?;
            if self.ctx.node_parameter(node, slot)? != Some(value) {
                self.ctx.set_parameter_by_index(node, slot, Some(value))?;
            }
        }
        self.ctx.process_graph(child)
    }
}

/// Object-safe kernel definition stored in the kernel table.
pub trait KernelDefDyn: Send + Sync {
    /// Logical identity.
    fn id(&self) -> KernelId;
    /// Unique name.
    fn name(&self) -> &str;
    /// Ordered parameter descriptors.
    fn signature(&self) -> &[ParamDesc];
    /// Attribute defaults.
    fn attributes(&self) -> KernelAttributes;
    /// Check bound parameters during verification.
    fn validate(&self, ctx: &ValidateContext<'_>, params: &[Option<Ref>]) -> VxResult<()>;
    /// Build per-node state at the end of verification.
    fn initialize(
        &self,
        ctx: &ValidateContext<'_>,
        params: &[Option<Ref>],
    ) -> VxResult<Box<dyn Any + Send>>;
    /// Execute once.
    fn process(
        &self,
        ctx: &mut ExecContext<'_>,
        state: &mut dyn Any,
        params: &[Option<Ref>],
    ) -> VxResult<()>;
    /// Tear down per-node state.
    fn deinitialize(&self, state: Box<dyn Any + Send>) -> VxResult<()>;
}

/// Kernel definition; implement this for your processing functions.
pub trait KernelDef: Send + Sync + 'static {
    /// Per-node state built by [`KernelDef::initialize`].
    type State: Send + 'static;
    /// Logical identity.
    fn id(&self) -> KernelId;
    /// Unique name.
    fn name(&self) -> &str;
    /// Ordered parameter descriptors.
    fn signature(&self) -> &[ParamDesc];
    /// Attribute defaults.
    fn attributes(&self) -> KernelAttributes {
        KernelAttributes::default()
    }
    /// Check bound parameters during verification.
    fn validate(&self, _ctx: &ValidateContext<'_>, _params: &[Option<Ref>]) -> VxResult<()> {
        Ok(())
    }
    /// Build per-node state at the end of verification.
    fn initialize(&self, ctx: &ValidateContext<'_>, params: &[Option<Ref>]) -> VxResult<Self::State>;
    /// Execute once.
    fn process(
        &self,
        ctx: &mut ExecContext<'_>,
        state: &mut Self::State,
        params: &[Option<Ref>],
    ) -> VxResult<()>;
    /// Tear down per-node state.
    fn deinitialize(&self, _state: Self::State) -> VxResult<()> {
        Ok(())
    }
}

impl<T: KernelDef> KernelDefDyn for T {
    fn id(&self) -> KernelId {
        <T as KernelDef>::id(self)
    }

    fn name(&self) -> &str {
        <T as KernelDef>::name(self)
    }

    fn signature(&self) -> &[ParamDesc] {
        <T as KernelDef>::signature(self)
    }

    fn attributes(&self) -> KernelAttributes {
        <T as KernelDef>::attributes(self)
    }

    fn validate(&self, ctx: &ValidateContext<'_>, params: &[Option<Ref>]) -> VxResult<()> {
        <T as KernelDef>::validate(self, ctx, params)
    }

    fn initialize(
        &self,
        ctx: &ValidateContext<'_>,
        params: &[Option<Ref>],
    ) -> VxResult<Box<dyn Any + Send>> {
        let state = <T as KernelDef>::initialize(self, ctx, params)?;
        Ok(Box::new(state))
    }

    fn process(
        &self,
        ctx: &mut ExecContext<'_>,
        state: &mut dyn Any,
        params: &[Option<Ref>],
    ) -> VxResult<()> {
        match state.downcast_mut::<<T as KernelDef>::State>() {
            Some(typed) => <T as KernelDef>::process(self, ctx, typed, params),
            None => Err(VxError::Internal(format!(
                "state type mismatch in kernel {}",
                <T as KernelDef>::name(self)
            ))),
        }
    }

    fn deinitialize(&self, state: Box<dyn Any + Send>) -> VxResult<()> {
        match state.downcast::<<T as KernelDef>::State>() {
            Ok(typed) => <T as KernelDef>::deinitialize(self, *typed),
            Err(_) => Err(VxError::Internal(format!(
                "state type mismatch in kernel {}",
                <T as KernelDef>::name(self)
            ))),
        }
    }
}

type ProcessFn = dyn Fn(&mut ExecContext<'_>, &[Option<Ref>]) -> VxResult<()> + Send + Sync;
type ValidateFn = dyn Fn(&ValidateContext<'_>, &[Option<Ref>]) -> VxResult<()> + Send + Sync;

/// Stateless kernel built from closures.
pub struct FnKernel {
    id: KernelId,
    name: String,
    signature: Vec<ParamDesc>,
    attributes: KernelAttributes,
    process: Box<ProcessFn>,
    validate: Option<Box<ValidateFn>>,
}

impl FnKernel {
    /// Kernel running `process` on every invocation.
    pub fn new<F>(id: KernelId, name: &str, signature: Vec<ParamDesc>, process: F) -> Self
    where
        F: Fn(&mut ExecContext<'_>, &[Option<Ref>]) -> VxResult<()> + Send + Sync + 'static,
    {
        Self {
            id,
            name: name.to_string(),
            signature,
            attributes: KernelAttributes::default(),
            process: Box::new(process),
            validate: None,
        }
    }

    /// Attach a validate hook.
    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&ValidateContext<'_>, &[Option<Ref>]) -> VxResult<()> + Send + Sync + 'static,
    {
        self.validate = Some(Box::new(validate));
        self
    }

    /// Override attribute defaults.
    pub fn with_attributes(mut self, attributes: KernelAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Debug for FnKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

impl KernelDef for FnKernel {
    type State = ();

    fn id(&self) -> KernelId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &[ParamDesc] {
        &self.signature
    }

    fn attributes(&self) -> KernelAttributes {
        self.attributes
    }

    fn validate(&self, ctx: &ValidateContext<'_>, params: &[Option<Ref>]) -> VxResult<()> {
        match &self.validate {
            Some(validate) => validate(ctx, params),
            None => Ok(()),
        }
    }

    fn initialize(&self, _ctx: &ValidateContext<'_>, _params: &[Option<Ref>]) -> VxResult<()> {
        Ok(())
    }

    fn process(&self, ctx: &mut ExecContext<'_>, _state: &mut (), params: &[Option<Ref>]) -> VxResult<()> {
        (self.process)(ctx, params)
    }
}

/// Kernel table entry.
pub(crate) struct KernelObj {
    pub def: Arc<dyn KernelDefDyn>,
    pub id: KernelId,
    pub name: String,
    pub signature: Vec<ParamDesc>,
    pub attributes: KernelAttributes,
    pub target: Ref,
}

impl Context {
    /// Add a kernel to a target's table; the target holds the internal reference.
    pub(crate) fn register_kernel(&mut self, target: Ref, def: Arc<dyn KernelDefDyn>) -> VxResult<Ref> {
        let signature = def.signature().to_vec();
        if signature.len() > MAX_PARAMETERS {
            return Err(VxError::NoResources(format!(
                "kernel {} declares {} parameters (limit {MAX_PARAMETERS})",
                def.name(),
                signature.len()
            )));
        }
        let id = def.id();
        let name = def.name().to_string();
        let table = self.target_obj(target)?;
        if table.find_kernel_by_id(id).is_some() || table.find_kernel_by_name(&name).is_some() {
            return Err(VxError::InvalidValue(format!(
                "target {} already provides {name} ({id})",
                table.name
            )));
        }
        let object = KernelObj {
            attributes: def.attributes(),
            def,
            id,
            name: name.clone(),
            signature,
            target,
        };
        let kernel = self.create_reference(
            RefType::Kernel,
            Counter::Internal,
            Some(target),
            Object::Kernel(object),
        )?;
        self.target_obj_mut(target)?.add_kernel(id, name.clone(), kernel);
        debug!(%kernel, %id, name = %name, "registered kernel");
        Ok(kernel)
    }

    /// Register a user kernel on the named target, or on the highest-priority one.
    ///
    /// Returns a host handle; release it with [`Context::release_kernel`].
    pub fn add_kernel<K: KernelDef>(&mut self, target: Option<&str>, kernel: K) -> VxResult<Ref> {
        self.add_kernel_dyn(target, Arc::new(kernel))
    }

    /// Object-safe variant of [`Context::add_kernel`].
    pub fn add_kernel_dyn(&mut self, target: Option<&str>, kernel: Arc<dyn KernelDefDyn>) -> VxResult<Ref> {
        let target = match target {
            Some(name) => self.find_target(name)?,
            None => self
                .targets
                .first()
                .copied()
                .ok_or_else(|| VxError::NotSupported("no targets loaded".to_string()))?,
        };
        let r = self.register_kernel(target, kernel)?;
        self.retain_reference(r)?;
        Ok(r)
    }

    /// Look up a kernel by name, searching targets in priority order.
    pub fn get_kernel_by_name(&mut self, name: &str) -> VxResult<Ref> {
        let found = self
            .targets
            .iter()
            .filter_map(|t| self.target_obj(*t).ok())
            .find_map(|t| t.find_kernel_by_name(name));
        let kernel =
            found.ok_or_else(|| VxError::NotSupported(format!("no kernel named {name}")))?;
        self.retain_reference(kernel)?;
        Ok(kernel)
    }

    /// Look up a kernel by identity, searching targets in priority order.
    pub fn get_kernel_by_enum(&mut self, id: KernelId) -> VxResult<Ref> {
        let found = self
            .targets
            .iter()
            .filter_map(|t| self.target_obj(*t).ok())
            .find_map(|t| t.find_kernel_by_id(id));
        let kernel = found.ok_or_else(|| VxError::NotSupported(format!("no kernel for {id}")))?;
        self.retain_reference(kernel)?;
        Ok(kernel)
    }

    /// Drop a host handle on a kernel.
    pub fn release_kernel(&mut self, kernel: Ref) -> VxResult<()> {
        self.kernel_obj(kernel)?;
        self.release_reference(kernel)
    }

    /// Kernel name.
    pub fn kernel_name(&self, kernel: Ref) -> VxResult<&str> {
        Ok(&self.kernel_obj(kernel)?.name)
    }

    /// Kernel identity.
    pub fn kernel_id(&self, kernel: Ref) -> VxResult<KernelId> {
        Ok(self.kernel_obj(kernel)?.id)
    }

    /// Ordered parameter descriptors.
    pub fn kernel_signature(&self, kernel: Ref) -> VxResult<&[ParamDesc]> {
        Ok(&self.kernel_obj(kernel)?.signature)
    }

    /// Number of declared parameters.
    pub fn kernel_parameter_count(&self, kernel: Ref) -> VxResult<usize> {
        Ok(self.kernel_obj(kernel)?.signature.len())
    }

    /// Attribute defaults.
    pub fn kernel_attributes(&self, kernel: Ref) -> VxResult<KernelAttributes> {
        Ok(self.kernel_obj(kernel)?.attributes)
    }

    /// Target that provides the kernel.
    pub fn kernel_target(&self, kernel: Ref) -> VxResult<Ref> {
        Ok(self.kernel_obj(kernel)?.target)
    }

    pub(crate) fn kernel_def(&self, kernel: Ref) -> VxResult<Arc<dyn KernelDefDyn>> {
        Ok(self.kernel_obj(kernel)?.def.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::target::CpuTarget;

    fn noop(id: u32, name: &str, signature: Vec<ParamDesc>) -> FnKernel {
        FnKernel::new(KernelId(id), name, signature, |_, _| Ok(()))
    }

    #[test]
    fn declared_types_accept_matching_values() {
        let any = ParamType::Any;
        assert!(any.accepts(RefType::Image, None));
        assert!(!any.accepts(RefType::Graph, None));
        let u8_scalar = ParamType::Scalar(ScalarType::U8);
        assert!(u8_scalar.accepts(RefType::Scalar, Some(ScalarType::U8)));
        assert!(!u8_scalar.accepts(RefType::Scalar, Some(ScalarType::I32)));
        assert!(!u8_scalar.accepts(RefType::Image, None));
        assert!(ParamType::Object(RefType::Image).accepts(RefType::Image, None));
        assert!(!ParamType::Object(RefType::Image).accepts(RefType::Tensor, None));
    }

    #[test]
    fn placeholders_exist_for_concrete_types_only() {
        assert!(ParamType::Scalar(ScalarType::F32).placeholder().is_some());
        assert!(ParamType::Object(RefType::Image).placeholder().is_some());
        assert!(ParamType::Object(RefType::ObjectArray).placeholder().is_none());
        assert!(ParamType::Any.placeholder().is_none());
    }

    #[test]
    fn kernel_lookup_by_name_and_enum() {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.load_target(Arc::new(
            CpuTarget::new("vxcore.cpu").with_kernel(noop(1, "test.copy", vec![])),
        ))
        .unwrap();
        let by_name = ctx.get_kernel_by_name("test.copy").unwrap();
        let by_enum = ctx.get_kernel_by_enum(KernelId(1)).unwrap();
        assert_eq!(by_name, by_enum);
        assert_eq!(ctx.reference_count(by_name).unwrap(), 2);
        assert_eq!(ctx.kernel_name(by_name).unwrap(), "test.copy");
        ctx.release_kernel(by_name).unwrap();
        ctx.release_kernel(by_enum).unwrap();
        assert!(ctx.is_valid_reference(by_name, Some(RefType::Kernel)));
        assert!(matches!(
            ctx.get_kernel_by_name("test.missing"),
            Err(VxError::NotSupported(_))
        ));
    }

    #[test]
    fn oversized_signature_is_rejected() {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.load_target(Arc::new(CpuTarget::new("vxcore.cpu"))).unwrap();
        let signature = vec![ParamDesc::input(ParamType::Any); MAX_PARAMETERS + 1];
        let err = ctx.add_kernel(None, noop(9, "test.wide", signature)).unwrap_err();
        assert!(matches!(err, VxError::NoResources(_)));
    }

    #[test]
    fn duplicate_kernel_on_one_target_is_rejected() {
        let mut ctx = Context::new(ContextConfig::default());
        ctx.load_target(Arc::new(CpuTarget::new("vxcore.cpu"))).unwrap();
        let k = ctx.add_kernel(None, noop(3, "test.dup", vec![])).unwrap();
        assert!(ctx.add_kernel(None, noop(3, "test.dup", vec![])).is_err());
        ctx.release_kernel(k).unwrap();
    }

    #[test]
    fn add_kernel_without_targets_is_not_supported() {
        let mut ctx = Context::new(ContextConfig::default());
        assert!(matches!(
            ctx.add_kernel(None, noop(3, "test.orphan", vec![])),
            Err(VxError::NotSupported(_))
        ));
    }
}
