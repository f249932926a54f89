//! Entity model: typed handles, reference counts and the slot arena that owns every object.
//!
//! Every graph object (graph, node, kernel, parameter handle, target, delay and data
//! object) lives in one slot of the owning [`Context`]'s arena. A [`Ref`] names a slot by
//! index and generation; freeing a slot advances its generation so old handles fail
//! validation instead of aliasing a new occupant.
//!
//! Each entity carries two counts. The internal count tracks edges held by other entities
//! (a graph holding its nodes, a node holding its parameters); the external count tracks
//! handles held by the host. The entity is destroyed exactly when both reach zero.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::context::Context;
use crate::data::DataObject;
use crate::delay::DelayObj;
use crate::error::{VxError, VxResult};
use crate::graph::GraphObj;
use crate::invariant_ppt::{assert_invariant, REF_COUNT_BALANCED, REF_DESTROYED_ONCE};
use crate::kernel::KernelObj;
use crate::node::NodeObj;
use crate::parameter::ParamObj;
use crate::target::TargetObj;
use scopeguard::ScopeGuard;
use std::fmt;
use tracing::{error, trace, warn};

/// Kind of an entity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    /// The engine instance itself.
    Context,
    /// A graph of nodes.
    Graph,
    /// A kernel instance inside a graph.
    Node,
    /// A registered processing function.
    Kernel,
    /// A parameter binding handle.
    Parameter,
    /// An execution backend.
    Target,
    /// A rolling buffer of data objects.
    Delay,
    /// A single typed value.
    Scalar,
    /// A two-dimensional image.
    Image,
    /// A one-dimensional array.
    Array,
    /// A lookup table.
    Lut,
    /// A matrix.
    Matrix,
    /// A convolution mask.
    Convolution,
    /// A histogram distribution.
    Distribution,
    /// A threshold.
    Threshold,
    /// A geometric remap table.
    Remap,
    /// A multi-level image container.
    Pyramid,
    /// A homogeneous container of data objects.
    ObjectArray,
    /// An N-dimensional tensor.
    Tensor,
    /// An opaque user-defined payload.
    UserData,
}

impl RefType {
    /// Whether this kind can be bound to a node parameter.
    pub fn is_data_object(self) -> bool {
        !matches!(
            self,
            RefType::Context
                | RefType::Graph
                | RefType::Node
                | RefType::Kernel
                | RefType::Parameter
                | RefType::Target
        )
    }

    /// Whether this kind holds items that replicated nodes fan out over.
    pub fn is_container(self) -> bool {
        matches!(self, RefType::Pyramid | RefType::ObjectArray)
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefType::Context => "context",
            RefType::Graph => "graph",
            RefType::Node => "node",
            RefType::Kernel => "kernel",
            RefType::Parameter => "parameter",
            RefType::Target => "target",
            RefType::Delay => "delay",
            RefType::Scalar => "scalar",
            RefType::Image => "image",
            RefType::Array => "array",
            RefType::Lut => "lut",
            RefType::Matrix => "matrix",
            RefType::Convolution => "convolution",
            RefType::Distribution => "distribution",
            RefType::Threshold => "threshold",
            RefType::Remap => "remap",
            RefType::Pyramid => "pyramid",
            RefType::ObjectArray => "object_array",
            RefType::Tensor => "tensor",
            RefType::UserData => "user_data",
        };
        f.write_str(name)
    }
}

/// Which of the two counts an operation adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Edges held by other entities.
    Internal,
    /// Handles held by the host.
    External,
}

/// Handle to an entity owned by a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    pub(crate) context: u32,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Ref {
    /// Slot index inside the owning context's arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({}:{}.{})", self.context, self.index, self.generation)
    }
}

/// Position of a data object inside a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DelayTag {
    pub delay: Ref,
    pub slot: usize,
}

/// Fields common to every entity.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub kind: RefType,
    /// Logical container. Never used for destruction.
    pub scope: Option<Ref>,
    pub internal: u32,
    pub external: u32,
    pub is_virtual: bool,
    pub accessible: bool,
    pub extracted: bool,
    pub name: String,
    pub delay: Option<DelayTag>,
}

impl Header {
    pub fn new(kind: RefType, scope: Option<Ref>) -> Self {
        Self {
            kind,
            scope,
            internal: 0,
            external: 0,
            is_virtual: false,
            accessible: true,
            extracted: false,
            name: String::new(),
            delay: None,
        }
    }
}

/// Type-specific payload of an entity.
pub(crate) enum Object {
    Graph(GraphObj),
    Node(NodeObj),
    Kernel(KernelObj),
    Parameter(ParamObj),
    Target(TargetObj),
    Delay(DelayObj),
    Data(Box<dyn DataObject>),
}

macro_rules! object_accessors {
    ($($variant:ident => $ty:ty, $as_ref:ident, $as_mut:ident;)*) => {
        impl Object {
            $(
                #[allow(dead_code)]
                pub(crate) fn $as_ref(&self) -> Option<&$ty> {
                    match self {
                        Object::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                #[allow(dead_code)]
                pub(crate) fn $as_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Object::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }
    };
}

object_accessors! {
    Graph => GraphObj, as_graph, as_graph_mut;
    Node => NodeObj, as_node, as_node_mut;
    Kernel => KernelObj, as_kernel, as_kernel_mut;
    Parameter => ParamObj, as_parameter, as_parameter_mut;
    Target => TargetObj, as_target, as_target_mut;
    Delay => DelayObj, as_delay, as_delay_mut;
    Data => Box<dyn DataObject>, as_data, as_data_mut;
}

pub(crate) struct Entity {
    pub header: Header,
    pub object: Object,
}

struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Fixed-capacity slot storage. Index plus generation is identity.
pub(crate) struct Arena {
    context: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl Arena {
    pub fn new(context: u32, capacity: usize) -> Self {
        Self {
            context,
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub fn insert(&mut self, entity: Entity) -> VxResult<Ref> {
        if self.live >= self.capacity {
            return Err(VxError::NoResources(format!(
                "reference arena full ({} entities)",
                self.capacity
            )));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entity: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entity = Some(entity);
        self.live += 1;
        Ok(Ref {
            context: self.context,
            index,
            generation: slot.generation,
        })
    }

    fn check_context(&self, r: Ref) -> VxResult<()> {
        if r.context != self.context {
            return Err(VxError::BadReference(format!(
                "{r} belongs to another context"
            )));
        }
        Ok(())
    }

    pub fn get(&self, r: Ref) -> VxResult<&Entity> {
        self.check_context(r)?;
        self.slots
            .get(r.index())
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.entity.as_ref())
            .ok_or_else(|| VxError::BadReference(format!("{r} is stale or unknown")))
    }

    pub fn get_mut(&mut self, r: Ref) -> VxResult<&mut Entity> {
        self.check_context(r)?;
        self.slots
            .get_mut(r.index())
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.entity.as_mut())
            .ok_or_else(|| VxError::BadReference(format!("{r} is stale or unknown")))
    }

    pub fn remove(&mut self, r: Ref) -> VxResult<Entity> {
        self.get(r)?;
        let slot = &mut self.slots[r.index()];
        let entity = slot
            .entity
            .take()
            .ok_or_else(|| VxError::Internal(format!("{r} vanished during removal")))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.index);
        self.live -= 1;
        Ok(entity)
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Handles of every live entity, in slot order.
    pub fn refs(&self) -> Vec<Ref> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entity.is_some())
            .map(|(index, slot)| Ref {
                context: self.context,
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

fn corrupt(r: Ref) -> VxError {
    VxError::Internal(format!("{r} payload does not match its type tag"))
}

macro_rules! typed_access {
    ($($name:ident, $name_mut:ident => $kind:ident, $ty:ty, $as_ref:ident, $as_mut:ident;)*) => {
        impl Context {
            $(
                pub(crate) fn $name(&self, r: Ref) -> VxResult<&$ty> {
                    self.entity_of(r, RefType::$kind)?
                        .object
                        .$as_ref()
                        .ok_or_else(|| corrupt(r))
                }

                #[allow(dead_code)]
                pub(crate) fn $name_mut(&mut self, r: Ref) -> VxResult<&mut $ty> {
                    self.entity_of_mut(r, RefType::$kind)?
                        .object
                        .$as_mut()
                        .ok_or_else(|| corrupt(r))
                }
            )*
        }
    };
}

typed_access! {
    graph_obj, graph_obj_mut => Graph, GraphObj, as_graph, as_graph_mut;
    node_obj, node_obj_mut => Node, NodeObj, as_node, as_node_mut;
    kernel_obj, kernel_obj_mut => Kernel, KernelObj, as_kernel, as_kernel_mut;
    param_obj, param_obj_mut => Parameter, ParamObj, as_parameter, as_parameter_mut;
    target_obj, target_obj_mut => Target, TargetObj, as_target, as_target_mut;
    delay_obj, delay_obj_mut => Delay, DelayObj, as_delay, as_delay_mut;
}

impl Context {
    pub(crate) fn entity(&self, r: Ref) -> VxResult<&Entity> {
        self.arena.get(r)
    }

    pub(crate) fn entity_mut(&mut self, r: Ref) -> VxResult<&mut Entity> {
        self.arena.get_mut(r)
    }

    pub(crate) fn entity_of(&self, r: Ref, kind: RefType) -> VxResult<&Entity> {
        let entity = self.arena.get(r)?;
        if entity.header.kind != kind {
            return Err(VxError::BadReference(format!(
                "{r} is a {}, expected a {kind}",
                entity.header.kind
            )));
        }
        Ok(entity)
    }

    pub(crate) fn entity_of_mut(&mut self, r: Ref, kind: RefType) -> VxResult<&mut Entity> {
        let entity = self.arena.get_mut(r)?;
        if entity.header.kind != kind {
            return Err(VxError::BadReference(format!(
                "{r} is a {}, expected a {kind}",
                entity.header.kind
            )));
        }
        Ok(entity)
    }

    /// Allocate an entity with the requested count set to one.
    pub(crate) fn create_reference(
        &mut self,
        kind: RefType,
        counter: Counter,
        scope: Option<Ref>,
        object: Object,
    ) -> VxResult<Ref> {
        let mut header = Header::new(kind, scope);
        match counter {
            Counter::Internal => header.internal = 1,
            Counter::External => header.external = 1,
        }
        let r = self.arena.insert(Entity { header, object })?;
        trace!(reference = %r, %kind, ?counter, "created reference");
        Ok(r)
    }

    /// Check that `r` names a live entity of this context, optionally of a given kind.
    pub fn is_valid_reference(&self, r: Ref, kind: Option<RefType>) -> bool {
        match self.arena.get(r) {
            Ok(entity) => kind.map_or(true, |kind| entity.header.kind == kind),
            Err(_) => false,
        }
    }

    /// Add one to the chosen count and return the combined total.
    pub fn increment_reference(&mut self, r: Ref, counter: Counter) -> VxResult<u32> {
        let header = &mut self.arena.get_mut(r)?.header;
        match counter {
            Counter::Internal => header.internal += 1,
            Counter::External => header.external += 1,
        }
        Ok(header.internal + header.external)
    }

    /// Remove one from the chosen count; destroys the entity when both reach zero.
    ///
    /// Returns the combined total left. Decrementing a count that is already zero
    /// is reported as [`VxError::Internal`] and leaves the entity untouched.
    pub fn decrement_reference(&mut self, r: Ref, counter: Counter) -> VxResult<u32> {
        let header = &mut self.arena.get_mut(r)?.header;
        let count = match counter {
            Counter::Internal => &mut header.internal,
            Counter::External => &mut header.external,
        };
        if *count == 0 {
            error!(reference = %r, ?counter, "reference over-released");
            return Err(VxError::Internal(format!(
                "{r} over-released: {counter:?} count already zero"
            )));
        }
        let before = *count;
        *count -= 1;
        let after = *count;
        let total = header.internal + header.external;
        assert_invariant(
            REF_COUNT_BALANCED,
            after + 1 == before,
            "count decremented without underflow",
            Some("decrement_reference"),
        );
        if total == 0 {
            self.destroy(r)?;
        }
        Ok(total)
    }

    pub(crate) fn release_internal(&mut self, r: Ref) -> VxResult<()> {
        self.decrement_reference(r, Counter::Internal).map(|_| ())
    }

    /// Take a host handle on any entity.
    pub fn retain_reference(&mut self, r: Ref) -> VxResult<()> {
        self.increment_reference(r, Counter::External).map(|_| ())
    }

    /// Drop a host handle on any entity.
    pub fn release_reference(&mut self, r: Ref) -> VxResult<()> {
        self.decrement_reference(r, Counter::External).map(|_| ())
    }

    /// External (host) count.
    pub fn reference_count(&self, r: Ref) -> VxResult<u32> {
        Ok(self.arena.get(r)?.header.external)
    }

    /// Internal (graph-held) count.
    pub fn internal_count(&self, r: Ref) -> VxResult<u32> {
        Ok(self.arena.get(r)?.header.internal)
    }

    /// Kind of the entity behind `r`.
    pub fn reference_type(&self, r: Ref) -> VxResult<RefType> {
        Ok(self.arena.get(r)?.header.kind)
    }

    /// Logical container of the entity, if any.
    pub fn reference_scope(&self, r: Ref) -> VxResult<Option<Ref>> {
        Ok(self.arena.get(r)?.header.scope)
    }

    /// Whether the entity lives only inside a graph.
    pub fn is_virtual(&self, r: Ref) -> VxResult<bool> {
        Ok(self.arena.get(r)?.header.is_virtual)
    }

    /// Whether the entity has been fetched through a parameter handle by the host.
    pub fn is_extracted(&self, r: Ref) -> VxResult<bool> {
        Ok(self.arena.get(r)?.header.extracted)
    }

    /// Attach a debug name.
    pub fn set_reference_name(&mut self, r: Ref, name: &str) -> VxResult<()> {
        self.arena.get_mut(r)?.header.name = name.to_string();
        Ok(())
    }

    /// Debug name, empty when unset.
    pub fn reference_name(&self, r: Ref) -> VxResult<&str> {
        Ok(&self.arena.get(r)?.header.name)
    }

    /// Number of live entities.
    pub fn live_references(&self) -> usize {
        self.arena.live()
    }

    /// Number of entities destroyed so far.
    pub fn destroyed_references(&self) -> u64 {
        self.destroyed
    }

    /// Hold an internal reference on `r` for the lifetime of the returned guard.
    ///
    /// The guard dereferences to the context, so work that must keep `r` alive can
    /// run through it; the reference is released on every exit path.
    pub fn hold<'a>(
        &'a mut self,
        r: Ref,
    ) -> VxResult<ScopeGuard<&'a mut Self, impl FnOnce(&'a mut Self) + 'a>> {
        self.increment_reference(r, Counter::Internal)?;
        Ok(scopeguard::guard(self, move |ctx: &'a mut Context| {
            if let Err(err) = ctx.decrement_reference(r, Counter::Internal) {
                warn!(reference = %r, %err, "failed to release held reference");
            }
        }))
    }

    fn destroy(&mut self, r: Ref) -> VxResult<()> {
        let entity = self.arena.remove(r)?;
        self.destroyed += 1;
        assert_invariant(
            REF_DESTROYED_ONCE,
            self.arena.get(r).is_err(),
            "destroyed slot is no longer addressable",
            Some("destroy"),
        );
        trace!(reference = %r, kind = %entity.header.kind, "destroying reference");
        match entity.object {
            Object::Graph(graph) => self.destruct_graph(r, graph),
            Object::Node(node) => self.destruct_node(r, node),
            Object::Parameter(param) => self.destruct_parameter(param),
            Object::Kernel(_) => Ok(()),
            Object::Target(target) => self.destruct_target(target),
            Object::Delay(delay) => self.destruct_delay(delay),
            Object::Data(data) => self.destruct_data(data),
        }
    }
}
