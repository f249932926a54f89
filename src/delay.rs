//! Delays: fixed rings of data objects addressed relative to the current slot.
//!
//! Slot `0` is the current object, `-1` the previous one, and so on. Aging rotates
//! the ring by one and rebinds every node parameter associated with a relative
//! position to the object that now sits there.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::reference::{Counter, DelayTag, Object, Ref, RefType};
use tracing::{debug, trace};

pub(crate) struct DelayObj {
    pub refs: Vec<Ref>,
    /// Absolute slot holding relative position 0.
    pub index: usize,
    /// Node slots bound to each relative position.
    pub associations: Vec<Vec<(Ref, usize)>>,
}

impl DelayObj {
    fn relative(&self, slot: usize) -> usize {
        let count = self.refs.len();
        (slot + count - self.index) % count
    }
}

impl Context {
    /// Create a delay of `slots` copies of `exemplar`.
    pub fn create_delay(&mut self, exemplar: Ref, slots: usize) -> VxResult<Ref> {
        if slots == 0 {
            return Err(VxError::InvalidValue("delay needs at least one slot".to_string()));
        }
        let data = self.data_obj(exemplar)?;
        let kind = data.kind();
        let mut copies = Vec::with_capacity(slots);
        for _ in 0..slots {
            let copy = data.duplicate().ok_or_else(|| {
                VxError::NotSupported(format!("{kind} objects cannot be placed in a delay"))
            })?;
            copies.push(copy);
        }
        let object = DelayObj {
            refs: Vec::with_capacity(slots),
            index: 0,
            associations: vec![Vec::new(); slots],
        };
        let delay = self.create_reference(RefType::Delay, Counter::External, None, Object::Delay(object))?;
        for (slot, copy) in copies.into_iter().enumerate() {
            let kind = copy.kind();
            match self.create_reference(kind, Counter::Internal, Some(delay), Object::Data(copy)) {
                Ok(r) => {
                    self.entity_mut(r)?.header.delay = Some(DelayTag { delay, slot });
                    self.delay_obj_mut(delay)?.refs.push(r);
                }
                Err(err) => {
                    self.release_reference(delay)?;
                    return Err(err);
                }
            }
        }
        debug!(%delay, slots, %kind, "created delay");
        Ok(delay)
    }

    /// Drop a host handle on a delay.
    pub fn release_delay(&mut self, delay: Ref) -> VxResult<()> {
        self.delay_obj(delay)?;
        self.release_reference(delay)
    }

    /// Number of slots.
    pub fn delay_slots(&self, delay: Ref) -> VxResult<usize> {
        Ok(self.delay_obj(delay)?.refs.len())
    }

    /// Object at relative position `index` (0, -1, -2, ...).
    ///
    /// No handle is taken; the object lives as long as the delay.
    pub fn get_delay_reference(&self, delay: Ref, index: i32) -> VxResult<Ref> {
        let d = self.delay_obj(delay)?;
        let count = d.refs.len();
        let back = usize::try_from(-i64::from(index)).ok().filter(|back| *back < count);
        let back = back.ok_or_else(|| {
            VxError::InvalidValue(format!("delay index {index} out of range for {count} slots"))
        })?;
        Ok(d.refs[(d.index + back) % count])
    }

    /// Rotate the delay by one and rebind associated node parameters.
    pub fn age_delay(&mut self, delay: Ref) -> VxResult<()> {
        let (refs, index, associations) = {
            let d = self.delay_obj_mut(delay)?;
            let count = d.refs.len();
            d.index = (d.index + count - 1) % count;
            (d.refs.clone(), d.index, d.associations.clone())
        };
        let count = refs.len();
        for (position, links) in associations.iter().enumerate() {
            let value = refs[(index + position) % count];
            for &(node, slot) in links {
                self.replace_slot(node, slot, Some(value), false)?;
            }
        }
        trace!(%delay, index, "delay aged");
        Ok(())
    }

    /// Record that slot `index` of `node` is bound to the delay object `tag` names.
    pub(crate) fn link_delay_slot(&mut self, tag: DelayTag, node: Ref, index: usize) -> VxResult<()> {
        let d = self.delay_obj_mut(tag.delay)?;
        let position = d.relative(tag.slot);
        let links = d.associations.get_mut(position).ok_or_else(|| {
            VxError::Internal(format!("{} has no slot {}", tag.delay, tag.slot))
        })?;
        links.push((node, index));
        Ok(())
    }

    /// Forget a binding recorded by [`Context::link_delay_slot`].
    pub(crate) fn unlink_delay_slot(&mut self, tag: DelayTag, node: Ref, index: usize) -> VxResult<()> {
        let d = self.delay_obj_mut(tag.delay)?;
        let position = d.relative(tag.slot);
        let links = d.associations.get_mut(position).ok_or_else(|| {
            VxError::Internal(format!("{} has no slot {}", tag.delay, tag.slot))
        })?;
        let found = links.iter().position(|link| *link == (node, index)).ok_or_else(|| {
            VxError::Internal(format!(
                "{node} parameter {index} is not associated with {}",
                tag.delay
            ))
        })?;
        links.remove(found);
        Ok(())
    }

    pub(crate) fn destruct_delay(&mut self, delay: DelayObj) -> VxResult<()> {
        for slot in delay.refs {
            if let Ok(entity) = self.entity_mut(slot) {
                entity.header.delay = None;
            }
            self.release_internal(slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::data::ScalarValue;

    #[test]
    fn aging_rotates_relative_positions() {
        let mut ctx = Context::new(ContextConfig::default());
        let exemplar = ctx.create_scalar(ScalarValue::U8(0)).unwrap();
        let delay = ctx.create_delay(exemplar, 3).unwrap();
        let slots: Vec<Ref> = (0..3)
            .map(|i| ctx.get_delay_reference(delay, -i).unwrap())
            .collect();
        ctx.age_delay(delay).unwrap();
        assert_eq!(ctx.get_delay_reference(delay, -1).unwrap(), slots[0]);
        assert_eq!(ctx.get_delay_reference(delay, -2).unwrap(), slots[1]);
        assert_eq!(ctx.get_delay_reference(delay, 0).unwrap(), slots[2]);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut ctx = Context::new(ContextConfig::default());
        let exemplar = ctx.create_scalar(ScalarValue::U8(0)).unwrap();
        let delay = ctx.create_delay(exemplar, 2).unwrap();
        assert!(ctx.get_delay_reference(delay, 1).is_err());
        assert!(ctx.get_delay_reference(delay, -2).is_err());
        assert!(ctx.create_delay(exemplar, 0).is_err());
    }

    #[test]
    fn releasing_delay_releases_slots() {
        let mut ctx = Context::new(ContextConfig::default());
        let exemplar = ctx.create_scalar(ScalarValue::U8(0)).unwrap();
        let delay = ctx.create_delay(exemplar, 4).unwrap();
        assert_eq!(ctx.live_references(), 6);
        ctx.release_delay(delay).unwrap();
        assert_eq!(ctx.live_references(), 1);
    }

    #[test]
    fn unlinking_unknown_association_is_internal_error() {
        let mut ctx = Context::new(ContextConfig::default());
        let exemplar = ctx.create_scalar(ScalarValue::U8(0)).unwrap();
        let delay = ctx.create_delay(exemplar, 2).unwrap();
        let tag = DelayTag { delay, slot: 1 };
        assert!(matches!(
            ctx.unlink_delay_slot(tag, exemplar, 0),
            Err(VxError::Internal(_))
        ));
    }
}
