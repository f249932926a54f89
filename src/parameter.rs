//! Parameter binding and parameter handles.
//!
//! Binding a value to a node slot type-checks it against the kernel signature, keeps
//! delay associations current and moves one internal reference from the old value
//! to the new one.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::invariant_ppt::{assert_invariant, PARAM_TYPE_CHECKED};
use crate::kernel::{ParamDesc, ParamState};
use crate::reference::{Counter, Object, Ref, RefType};
use tracing::trace;

/// Parameter handle payload. `node` is absent for handles taken from a kernel.
#[derive(Debug)]
pub(crate) struct ParamObj {
    pub index: usize,
    pub node: Option<Ref>,
    pub kernel: Ref,
}

impl Context {
    /// Bind `value` to slot `index` of `node`.
    ///
    /// Clearing an optional slot is a no-op. Clearing a required slot binds a fresh
    /// default object of the declared type; types without a default are not supported.
    /// A successful bind marks the owning graph for re-verification.
    pub fn set_parameter_by_index(&mut self, node: Ref, index: usize, value: Option<Ref>) -> VxResult<()> {
        self.bind_parameter(node, index, value, true)
    }

    pub(crate) fn bind_parameter(
        &mut self,
        node: Ref,
        index: usize,
        value: Option<Ref>,
        unverify: bool,
    ) -> VxResult<()> {
        let (kernel, graph, previous) = {
            let n = self.node_obj(node)?;
            (n.kernel, n.graph, n.parameters.get(index).copied().flatten())
        };
        let desc = self.slot_desc(kernel, node, index)?;
        let (value, adopted) = match value {
            Some(value) => (value, false),
            None if desc.state == ParamState::Optional => return Ok(()),
            None => {
                let placeholder = desc.ty.placeholder().ok_or_else(|| {
                    VxError::NotSupported(format!(
                        "no default {} for required parameter {index} of {node}",
                        desc.ty
                    ))
                })?;
                let kind = placeholder.kind();
                let r = self.create_reference(kind, Counter::Internal, Some(node), Object::Data(placeholder))?;
                (r, true)
            }
        };
        let checked = self.check_binding(&desc, value);
        assert_invariant(
            PARAM_TYPE_CHECKED,
            !adopted || checked.is_ok(),
            "default placeholder matches declared type",
            Some("bind_parameter"),
        );
        if let Err(err) = checked {
            if adopted {
                self.release_internal(value)?;
            }
            return Err(err);
        }
        if let Some(previous) = previous {
            if let Some(tag) = self.entity(previous)?.header.delay {
                self.unlink_delay_slot(tag, node, index)?;
            }
        }
        if let Some(tag) = self.entity(value)?.header.delay {
            self.link_delay_slot(tag, node, index)?;
        }
        self.replace_slot(node, index, Some(value), adopted)?;
        trace!(%node, index, %value, "parameter bound");
        if unverify {
            self.mark_mutated(graph)?;
        }
        Ok(())
    }

    /// Store `value` in a slot, moving the slot's internal reference.
    ///
    /// With `adopted` the caller's internal reference on `value` is taken over.
    pub(crate) fn replace_slot(
        &mut self,
        node: Ref,
        index: usize,
        value: Option<Ref>,
        adopted: bool,
    ) -> VxResult<()> {
        if let (Some(value), false) = (value, adopted) {
            self.increment_reference(value, Counter::Internal)?;
        }
        let slot = self
            .node_obj_mut(node)?
            .parameters
            .get_mut(index)
            .ok_or_else(|| VxError::BadParameter(format!("index {index} out of range for {node}")))?;
        let previous = std::mem::replace(slot, value);
        if let Some(previous) = previous {
            self.release_internal(previous)?;
        }
        Ok(())
    }

    fn slot_desc(&self, kernel: Ref, node: Ref, index: usize) -> VxResult<ParamDesc> {
        self.kernel_obj(kernel)?
            .signature
            .get(index)
            .copied()
            .ok_or_else(|| VxError::BadParameter(format!("index {index} out of range for {node}")))
    }

    /// Check that `value` is a live data object accepted by `desc`.
    pub(crate) fn check_binding(&self, desc: &ParamDesc, value: Ref) -> VxResult<()> {
        let entity = self.entity(value)?;
        let kind = entity.header.kind;
        let scalar = entity.object.as_data().and_then(|data| data.scalar_type());
        if !kind.is_data_object() || !desc.ty.accepts(kind, scalar) {
            let found = match scalar {
                Some(ty) => format!("scalar({ty})"),
                None => kind.to_string(),
            };
            return Err(VxError::invalid_type(desc.ty, found));
        }
        Ok(())
    }

    /// Handle on slot `index` of `node`.
    pub fn get_parameter_by_index(&mut self, node: Ref, index: usize) -> VxResult<Ref> {
        let kernel = self.node_obj(node)?.kernel;
        self.slot_desc(kernel, node, index)?;
        self.create_parameter(index, Some(node), kernel)
    }

    /// Handle on declaration `index` of `kernel`. Such handles describe the slot but
    /// carry no bound value.
    pub fn get_kernel_parameter_by_index(&mut self, kernel: Ref, index: usize) -> VxResult<Ref> {
        let count = self.kernel_obj(kernel)?.signature.len();
        if index >= count {
            return Err(VxError::BadParameter(format!(
                "index {index} out of range for {kernel}"
            )));
        }
        self.create_parameter(index, None, kernel)
    }

    fn create_parameter(&mut self, index: usize, node: Option<Ref>, kernel: Ref) -> VxResult<Ref> {
        let scope = node.unwrap_or(kernel);
        let object = ParamObj { index, node, kernel };
        let param = self.create_reference(RefType::Parameter, Counter::External, Some(scope), Object::Parameter(object))?;
        if let Some(node) = node {
            self.increment_reference(node, Counter::Internal)?;
        }
        self.increment_reference(kernel, Counter::Internal)?;
        Ok(param)
    }

    /// Bind through a parameter handle.
    pub fn set_parameter_by_reference(&mut self, param: Ref, value: Option<Ref>) -> VxResult<()> {
        let obj = self.param_obj(param)?;
        let index = obj.index;
        let node = obj.node.ok_or_else(|| {
            VxError::InvalidValue(format!("{param} describes a kernel, not a node slot"))
        })?;
        self.set_parameter_by_index(node, index, value)
    }

    /// Value currently bound behind a parameter handle, returned with a host handle.
    ///
    /// The first host handle on a graph-held value marks it as extracted.
    pub fn parameter_ref(&mut self, param: Ref) -> VxResult<Option<Ref>> {
        let obj = self.param_obj(param)?;
        let (index, node) = (obj.index, obj.node);
        let Some(node) = node else {
            return Ok(None);
        };
        let value = self.node_parameter(node, index)?;
        if let Some(value) = value {
            let header = &mut self.entity_mut(value)?.header;
            if header.external == 0 {
                header.extracted = true;
            }
            header.external += 1;
        }
        Ok(value)
    }

    /// Slot index behind a parameter handle.
    pub fn parameter_index(&self, param: Ref) -> VxResult<usize> {
        Ok(self.param_obj(param)?.index)
    }

    /// Declaration behind a parameter handle.
    pub fn parameter_desc(&self, param: Ref) -> VxResult<ParamDesc> {
        let obj = self.param_obj(param)?;
        let node = obj.node.unwrap_or(obj.kernel);
        self.slot_desc(obj.kernel, node, obj.index)
    }

    /// Drop a parameter handle.
    pub fn release_parameter(&mut self, param: Ref) -> VxResult<()> {
        self.param_obj(param)?;
        self.release_reference(param)
    }

    pub(crate) fn destruct_parameter(&mut self, param: ParamObj) -> VxResult<()> {
        if let Some(node) = param.node {
            self.release_internal(node)?;
        }
        self.release_internal(param.kernel)
    }
}
