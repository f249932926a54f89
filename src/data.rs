//! Data-object contract and the minimal objects the engine itself needs.
//!
//! Concrete image/tensor/array payloads live outside the engine; they only have to
//! implement [`DataObject`]. The engine ships scalars (for typed binding), a generic
//! byte [`Buffer`] tagged with a data kind, and the two container kinds that node
//! replication fans out over: [`ObjectArray`] and [`Pyramid`].

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::reference::{Counter, Object, Ref, RefType};
use std::any::Any;
use std::fmt;

/// Contract every bindable payload satisfies.
pub trait DataObject: Any + Send + Sync + fmt::Debug {
    /// Type tag checked against parameter declarations.
    fn kind(&self) -> RefType;

    /// Numeric sub-type, for scalars.
    fn scalar_type(&self) -> Option<ScalarType> {
        None
    }

    /// Items of a container, in order.
    fn items(&self) -> &[Ref] {
        &[]
    }

    /// Fresh object with the same metadata, used to fill delay slots.
    fn duplicate(&self) -> Option<Box<dyn DataObject>> {
        None
    }

    /// Payload size.
    fn size_in_bytes(&self) -> usize {
        0
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Numeric kind carried by a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// 8-bit character.
    Char,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Boolean.
    Bool,
    /// Platform size.
    Size,
    /// Enumerated constant.
    Enum,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Char => "char",
            ScalarType::I8 => "i8",
            ScalarType::U8 => "u8",
            ScalarType::I16 => "i16",
            ScalarType::U16 => "u16",
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
            ScalarType::I64 => "i64",
            ScalarType::U64 => "u64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
            ScalarType::Size => "size",
            ScalarType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A typed scalar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    /// 8-bit character.
    Char(u8),
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Boolean.
    Bool(bool),
    /// Platform size.
    Size(usize),
    /// Enumerated constant.
    Enum(i32),
}

impl ScalarValue {
    /// Sub-type tag of this value.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Char(_) => ScalarType::Char,
            ScalarValue::I8(_) => ScalarType::I8,
            ScalarValue::U8(_) => ScalarType::U8,
            ScalarValue::I16(_) => ScalarType::I16,
            ScalarValue::U16(_) => ScalarType::U16,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::I64(_) => ScalarType::I64,
            ScalarValue::U64(_) => ScalarType::U64,
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
            ScalarValue::Bool(_) => ScalarType::Bool,
            ScalarValue::Size(_) => ScalarType::Size,
            ScalarValue::Enum(_) => ScalarType::Enum,
        }
    }

    /// Zero value of the given sub-type.
    pub fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Char => ScalarValue::Char(0),
            ScalarType::I8 => ScalarValue::I8(0),
            ScalarType::U8 => ScalarValue::U8(0),
            ScalarType::I16 => ScalarValue::I16(0),
            ScalarType::U16 => ScalarValue::U16(0),
            ScalarType::I32 => ScalarValue::I32(0),
            ScalarType::U32 => ScalarValue::U32(0),
            ScalarType::I64 => ScalarValue::I64(0),
            ScalarType::U64 => ScalarValue::U64(0),
            ScalarType::F32 => ScalarValue::F32(0.0),
            ScalarType::F64 => ScalarValue::F64(0.0),
            ScalarType::Bool => ScalarValue::Bool(false),
            ScalarType::Size => ScalarValue::Size(0),
            ScalarType::Enum => ScalarValue::Enum(0),
        }
    }

    fn size_in_bytes(&self) -> usize {
        match self {
            ScalarValue::Char(_) | ScalarValue::I8(_) | ScalarValue::U8(_) | ScalarValue::Bool(_) => 1,
            ScalarValue::I16(_) | ScalarValue::U16(_) => 2,
            ScalarValue::I32(_) | ScalarValue::U32(_) | ScalarValue::F32(_) | ScalarValue::Enum(_) => 4,
            ScalarValue::I64(_) | ScalarValue::U64(_) | ScalarValue::F64(_) => 8,
            ScalarValue::Size(_) => std::mem::size_of::<usize>(),
        }
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    value: ScalarValue,
}

impl Scalar {
    /// Wrap a value.
    pub fn new(value: ScalarValue) -> Self {
        Self { value }
    }

    /// Current value.
    pub fn value(&self) -> ScalarValue {
        self.value
    }

    /// Replace the value; the sub-type must not change.
    pub fn set(&mut self, value: ScalarValue) -> VxResult<()> {
        if value.scalar_type() != self.value.scalar_type() {
            return Err(VxError::invalid_type(
                self.value.scalar_type(),
                value.scalar_type(),
            ));
        }
        self.value = value;
        Ok(())
    }
}

impl DataObject for Scalar {
    fn kind(&self) -> RefType {
        RefType::Scalar
    }

    fn scalar_type(&self) -> Option<ScalarType> {
        Some(self.value.scalar_type())
    }

    fn duplicate(&self) -> Option<Box<dyn DataObject>> {
        Some(Box::new(self.clone()))
    }

    fn size_in_bytes(&self) -> usize {
        self.value.size_in_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opaque memory object tagged with a data kind (image, array, tensor, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    kind: RefType,
    data: Vec<u8>,
}

impl Buffer {
    /// Zero-filled buffer of `size` bytes.
    pub fn new(kind: RefType, size: usize) -> VxResult<Self> {
        if !is_memory_kind(kind) {
            return Err(VxError::InvalidValue(format!(
                "{kind} cannot be represented as a plain buffer"
            )));
        }
        Ok(Self {
            kind,
            data: vec![0; size],
        })
    }

    /// Payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable payload bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl DataObject for Buffer {
    fn kind(&self) -> RefType {
        self.kind
    }

    fn duplicate(&self) -> Option<Box<dyn DataObject>> {
        Some(Box::new(Self {
            kind: self.kind,
            data: vec![0; self.data.len()],
        }))
    }

    fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Homogeneous container of data objects.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectArray {
    item_kind: RefType,
    items: Vec<Ref>,
}

impl ObjectArray {
    /// Kind shared by every item.
    pub fn item_kind(&self) -> RefType {
        self.item_kind
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the array has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DataObject for ObjectArray {
    fn kind(&self) -> RefType {
        RefType::ObjectArray
    }

    fn items(&self) -> &[Ref] {
        &self.items
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Multi-level image container.
#[derive(Debug, Clone, PartialEq)]
pub struct Pyramid {
    levels: Vec<Ref>,
}

impl Pyramid {
    /// Number of levels.
    pub fn levels(&self) -> usize {
        self.levels.len()
    }
}

impl DataObject for Pyramid {
    fn kind(&self) -> RefType {
        RefType::Pyramid
    }

    fn items(&self) -> &[Ref] {
        &self.levels
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn is_memory_kind(kind: RefType) -> bool {
    kind.is_data_object()
        && !matches!(
            kind,
            RefType::Scalar | RefType::Delay | RefType::Pyramid | RefType::ObjectArray
        )
}

impl Context {
    fn insert_data(
        &mut self,
        object: Box<dyn DataObject>,
        counter: Counter,
        scope: Option<Ref>,
        is_virtual: bool,
    ) -> VxResult<Ref> {
        let kind = object.kind();
        let r = self.create_reference(kind, counter, scope, Object::Data(object))?;
        if is_virtual {
            let header = &mut self.entity_mut(r)?.header;
            header.is_virtual = true;
            header.accessible = false;
        }
        Ok(r)
    }

    /// Register a host-defined data object. Containers must use their own constructors.
    pub fn create_data_object(&mut self, object: Box<dyn DataObject>) -> VxResult<Ref> {
        let kind = object.kind();
        if !kind.is_data_object() || kind.is_container() || kind == RefType::Delay {
            return Err(VxError::InvalidType {
                expected: "plain data object".to_string(),
                found: kind.to_string(),
            });
        }
        self.insert_data(object, Counter::External, None, false)
    }

    /// Create a scalar holding `value`.
    pub fn create_scalar(&mut self, value: ScalarValue) -> VxResult<Ref> {
        self.insert_data(Box::new(Scalar::new(value)), Counter::External, None, false)
    }

    /// Create a graph-scoped scalar, accessible to the host only while the graph runs.
    pub fn create_virtual_scalar(&mut self, graph: Ref, ty: ScalarType) -> VxResult<Ref> {
        self.graph_obj(graph)?;
        self.insert_data(
            Box::new(Scalar::new(ScalarValue::zero(ty))),
            Counter::External,
            Some(graph),
            true,
        )
    }

    /// Create a zero-filled memory object of `kind`.
    pub fn create_buffer(&mut self, kind: RefType, size: usize) -> VxResult<Ref> {
        let buffer = Buffer::new(kind, size)?;
        self.insert_data(Box::new(buffer), Counter::External, None, false)
    }

    /// Create a graph-scoped memory object, accessible to the host only while the graph runs.
    pub fn create_virtual_buffer(&mut self, graph: Ref, kind: RefType, size: usize) -> VxResult<Ref> {
        self.graph_obj(graph)?;
        let buffer = Buffer::new(kind, size)?;
        self.insert_data(Box::new(buffer), Counter::External, Some(graph), true)
    }

    /// Create an object array owning `items`; all items must share one kind.
    pub fn create_object_array(&mut self, items: Vec<Box<dyn DataObject>>) -> VxResult<Ref> {
        let item_kind = match items.first() {
            Some(first) => first.kind(),
            None => {
                return Err(VxError::InvalidValue(
                    "object array needs at least one item".to_string(),
                ))
            }
        };
        if let Some(odd) = items.iter().find(|item| item.kind() != item_kind) {
            return Err(VxError::invalid_type(item_kind, odd.kind()));
        }
        let container = ObjectArray {
            item_kind,
            items: Vec::new(),
        };
        self.create_container(Box::new(container), items)
    }

    /// Create a pyramid owning `levels`, each of which must be an image.
    pub fn create_pyramid(&mut self, levels: Vec<Box<dyn DataObject>>) -> VxResult<Ref> {
        if levels.is_empty() {
            return Err(VxError::InvalidValue(
                "pyramid needs at least one level".to_string(),
            ));
        }
        if let Some(odd) = levels.iter().find(|level| level.kind() != RefType::Image) {
            return Err(VxError::invalid_type(RefType::Image, odd.kind()));
        }
        self.create_container(Box::new(Pyramid { levels: Vec::new() }), levels)
    }

    fn create_container(
        &mut self,
        container: Box<dyn DataObject>,
        items: Vec<Box<dyn DataObject>>,
    ) -> VxResult<Ref> {
        let container_ref = self.insert_data(container, Counter::External, None, false)?;
        let mut refs = Vec::with_capacity(items.len());
        for item in items {
            match self.insert_data(item, Counter::Internal, Some(container_ref), false) {
                Ok(r) => refs.push(r),
                Err(err) => {
                    for r in refs {
                        self.release_internal(r)?;
                    }
                    self.release_reference(container_ref)?;
                    return Err(err);
                }
            }
        }
        let payload = self
            .entity_mut(container_ref)?
            .object
            .as_data_mut()
            .ok_or_else(|| VxError::Internal(format!("{container_ref} lost its payload")))?;
        let any = payload.as_any_mut();
        if let Some(array) = any.downcast_mut::<ObjectArray>() {
            array.items = refs;
        } else if let Some(pyramid) = any.downcast_mut::<Pyramid>() {
            pyramid.levels = refs;
        }
        Ok(container_ref)
    }

    /// Number of items in a pyramid or object array.
    pub fn container_len(&self, container: Ref) -> VxResult<usize> {
        let data = self.data_obj(container)?;
        if !data.kind().is_container() {
            return Err(VxError::invalid_type("container", data.kind()));
        }
        Ok(data.items().len())
    }

    /// Item `index` of a pyramid or object array, returned with a host handle.
    pub fn container_item(&mut self, container: Ref, index: usize) -> VxResult<Ref> {
        let data = self.data_obj(container)?;
        if !data.kind().is_container() {
            return Err(VxError::invalid_type("container", data.kind()));
        }
        let item = data.items().get(index).copied().ok_or_else(|| {
            VxError::BadParameter(format!("item {index} out of range for {container}"))
        })?;
        self.retain_reference(item)?;
        Ok(item)
    }

    /// Payload of a data object without access checks.
    pub(crate) fn data_obj(&self, r: Ref) -> VxResult<&(dyn DataObject + 'static)> {
        let entity = self.entity(r)?;
        entity
            .object
            .as_data()
            .map(|data| &**data)
            .ok_or_else(|| VxError::BadReference(format!("{r} is a {}, not a data object", entity.header.kind)))
    }

    pub(crate) fn data_obj_mut(&mut self, r: Ref) -> VxResult<&mut (dyn DataObject + 'static)> {
        let entity = self.entity_mut(r)?;
        let kind = entity.header.kind;
        entity
            .object
            .as_data_mut()
            .map(|data| &mut **data)
            .ok_or_else(|| VxError::BadReference(format!("{r} is a {kind}, not a data object")))
    }

    fn check_accessible(&self, r: Ref) -> VxResult<()> {
        let header = &self.entity(r)?.header;
        if header.is_virtual && !header.accessible {
            return Err(VxError::OptimizedAway(format!(
                "virtual {} {r} is only accessible while its graph executes",
                header.kind
            )));
        }
        Ok(())
    }

    /// Typed read access to a data object.
    pub fn data<T: DataObject>(&self, r: Ref) -> VxResult<&T> {
        self.check_accessible(r)?;
        let data = self.data_obj(r)?;
        let kind = data.kind();
        data.as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| VxError::invalid_type(std::any::type_name::<T>(), kind))
    }

    /// Typed write access to a data object.
    pub fn data_mut<T: DataObject>(&mut self, r: Ref) -> VxResult<&mut T> {
        self.check_accessible(r)?;
        let data = self.data_obj_mut(r)?;
        let kind = data.kind();
        data.as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| VxError::invalid_type(std::any::type_name::<T>(), kind))
    }

    /// Value of a scalar.
    pub fn read_scalar(&self, r: Ref) -> VxResult<ScalarValue> {
        Ok(self.data::<Scalar>(r)?.value())
    }

    /// Overwrite a scalar; the sub-type must match.
    pub fn write_scalar(&mut self, r: Ref, value: ScalarValue) -> VxResult<()> {
        self.data_mut::<Scalar>(r)?.set(value)
    }

    pub(crate) fn destruct_data(&mut self, data: Box<dyn DataObject>) -> VxResult<()> {
        for item in data.items().to_vec() {
            self.release_internal(item)?;
        }
        Ok(())
    }

    /// Whether writing `a` can be observed by a reader of `b`: the same object, or a
    /// container and one of its items.
    pub(crate) fn check_write_dependency(&self, a: Ref, b: Ref) -> bool {
        if a == b {
            return true;
        }
        let (Ok(ea), Ok(eb)) = (self.entity(a), self.entity(b)) else {
            return false;
        };
        (ea.header.kind.is_container() && eb.header.scope == Some(a))
            || (eb.header.kind.is_container() && ea.header.scope == Some(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DataObject for Counted {
        fn kind(&self) -> RefType {
            RefType::UserData
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn scalar_write_keeps_sub_type() {
        let mut ctx = Context::new(ContextConfig::default());
        let s = ctx.create_scalar(ScalarValue::U32(7)).unwrap();
        ctx.write_scalar(s, ScalarValue::U32(9)).unwrap();
        assert_eq!(ctx.read_scalar(s).unwrap(), ScalarValue::U32(9));
        assert!(matches!(
            ctx.write_scalar(s, ScalarValue::F32(1.0)),
            Err(VxError::InvalidType { .. })
        ));
    }

    #[test]
    fn buffer_rejects_container_kinds() {
        assert!(Buffer::new(RefType::Pyramid, 4).is_err());
        assert!(Buffer::new(RefType::Image, 4).is_ok());
    }

    #[test]
    fn data_object_dropped_once_when_both_counts_reach_zero() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut ctx = Context::new(ContextConfig::default());
        let r = ctx
            .create_data_object(Box::new(Counted(drops.clone())))
            .unwrap();
        ctx.increment_reference(r, Counter::Internal).unwrap();
        ctx.release_reference(r).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        ctx.decrement_reference(r, Counter::Internal).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(ctx.decrement_reference(r, Counter::Internal).is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn object_array_items_are_scoped_to_the_array() {
        let mut ctx = Context::new(ContextConfig::default());
        let items: Vec<Box<dyn DataObject>> = (0..3)
            .map(|i| Box::new(Scalar::new(ScalarValue::I32(i))) as Box<dyn DataObject>)
            .collect();
        let array = ctx.create_object_array(items).unwrap();
        assert_eq!(ctx.container_len(array).unwrap(), 3);
        let item = ctx.container_item(array, 1).unwrap();
        assert_eq!(ctx.reference_scope(item).unwrap(), Some(array));
        assert_eq!(ctx.read_scalar(item).unwrap(), ScalarValue::I32(1));
        assert!(ctx.check_write_dependency(array, item));
        assert!(ctx.check_write_dependency(item, array));
        ctx.release_reference(item).unwrap();
        assert!(matches!(
            ctx.container_item(array, 3),
            Err(VxError::BadParameter(_))
        ));
    }

    #[test]
    fn releasing_container_releases_items() {
        let mut ctx = Context::new(ContextConfig::default());
        let levels: Vec<Box<dyn DataObject>> = (0..4)
            .map(|_| Box::new(Buffer::new(RefType::Image, 16).unwrap()) as Box<dyn DataObject>)
            .collect();
        let pyramid = ctx.create_pyramid(levels).unwrap();
        assert_eq!(ctx.live_references(), 5);
        ctx.release_reference(pyramid).unwrap();
        assert_eq!(ctx.live_references(), 0);
    }

    #[test]
    fn mixed_object_array_is_rejected() {
        let mut ctx = Context::new(ContextConfig::default());
        let items: Vec<Box<dyn DataObject>> = vec![
            Box::new(Scalar::new(ScalarValue::U8(1))),
            Box::new(Buffer::new(RefType::Image, 1).unwrap()),
        ];
        assert!(matches!(
            ctx.create_object_array(items),
            Err(VxError::InvalidType { .. })
        ));
        assert_eq!(ctx.live_references(), 0);
    }

    #[test]
    fn virtual_object_is_hidden_from_host() {
        let mut ctx = Context::new(ContextConfig::default());
        let graph = ctx.create_graph().unwrap();
        let v = ctx.create_virtual_buffer(graph, RefType::Image, 8).unwrap();
        assert!(ctx.is_virtual(v).unwrap());
        assert!(matches!(
            ctx.data::<Buffer>(v),
            Err(VxError::OptimizedAway(_))
        ));
    }
}
