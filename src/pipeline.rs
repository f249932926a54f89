//! Pipelined graph parameters.
//!
//! A queued graph parameter cycles through a fixed list of objects. The host
//! enqueues objects as ready; each pass binds the oldest ready object, then moves
//! it to done where the host dequeues it again.

#![forbid(unsafe_code)]

use crate::context::Context;
use crate::error::{VxError, VxResult};
use crate::queue::ExecutionQueue;
use crate::reference::Ref;
use std::sync::Arc;
use tracing::{debug, trace};

/// How a graph is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Each `process_graph` call runs one pass with the current bindings.
    #[default]
    Normal,
    /// Enqueueing a ready object runs a pass as soon as every queue has one.
    QueueAuto,
    /// Passes run when the host calls [`Context::schedule_graph`].
    QueueManual,
}

/// Objects that may flow through one graph parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueParams {
    /// Graph parameter index.
    pub graph_parameter_index: usize,
    /// Every object that will ever be enqueued on the parameter.
    pub refs: Vec<Ref>,
}

pub(crate) struct GraphQueue {
    pub queue: Arc<ExecutionQueue<Ref>>,
    pub refs: Vec<Ref>,
}

impl Context {
    /// Choose the scheduling mode and set up parameter queues.
    ///
    /// Queue depth is the configured default, raised to fit each reference list.
    /// [`ScheduleMode::Normal`] removes every queue.
    pub fn set_graph_schedule_config(
        &mut self,
        graph: Ref,
        mode: ScheduleMode,
        queues: &[QueueParams],
    ) -> VxResult<()> {
        if mode == ScheduleMode::Normal && !queues.is_empty() {
            return Err(VxError::InvalidValue(
                "normal scheduling takes no parameter queues".to_string(),
            ));
        }
        for params in queues {
            let desc = self.graph_parameter_desc(graph, params.graph_parameter_index)?;
            if params.refs.is_empty() {
                return Err(VxError::InvalidValue(format!(
                    "queue for graph parameter {} lists no objects",
                    params.graph_parameter_index
                )));
            }
            for r in &params.refs {
                self.check_binding(&desc, *r)?;
            }
        }
        let depth = self.config().queue_depth;
        let g = self.graph_obj_mut(graph)?;
        for parameter in &mut g.parameters {
            parameter.queue = None;
        }
        for params in queues {
            let queue = GraphQueue {
                queue: Arc::new(ExecutionQueue::new(depth.max(params.refs.len()))),
                refs: params.refs.clone(),
            };
            g.parameters[params.graph_parameter_index].queue = Some(queue);
        }
        g.schedule = mode;
        debug!(%graph, ?mode, queues = queues.len(), "schedule configured");
        Ok(())
    }

    /// Scheduling mode.
    pub fn graph_schedule_mode(&self, graph: Ref) -> VxResult<ScheduleMode> {
        Ok(self.graph_obj(graph)?.schedule)
    }

    fn parameter_queue(&self, graph: Ref, index: usize) -> VxResult<&GraphQueue> {
        self.graph_obj(graph)?
            .parameters
            .get(index)
            .ok_or_else(|| {
                VxError::BadParameter(format!("graph parameter {index} out of range for {graph}"))
            })?
            .queue
            .as_ref()
            .ok_or_else(|| {
                VxError::InvalidValue(format!("graph parameter {index} of {graph} is not queued"))
            })
    }

    /// Shared handle on the queue behind graph parameter `index`.
    pub fn graph_parameter_queue(&self, graph: Ref, index: usize) -> VxResult<Arc<ExecutionQueue<Ref>>> {
        Ok(self.parameter_queue(graph, index)?.queue.clone())
    }

    /// Hand objects to graph parameter `index` for upcoming passes.
    ///
    /// Each object must come from the parameter's configured list. Either every object
    /// is queued or, when the queue lacks room, none is. In
    /// [`ScheduleMode::QueueAuto`] passes run while every queue has an object ready.
    pub fn graph_parameter_enqueue_ready_ref(&mut self, graph: Ref, index: usize, refs: &[Ref]) -> VxResult<()> {
        let queue = {
            let q = self.parameter_queue(graph, index)?;
            if let Some(stranger) = refs.iter().find(|r| !q.refs.contains(r)) {
                return Err(VxError::InvalidValue(format!(
                    "{stranger} is not registered on graph parameter {index}"
                )));
            }
            q.queue.clone()
        };
        queue.enqueue_all(refs.to_vec()).map_err(|rejected| {
            VxError::NoResources(format!(
                "queue for graph parameter {index} has no room for {} objects",
                rejected.len()
            ))
        })?;
        for _ in refs {
            queue.move_pending_to_ready();
        }
        trace!(%graph, index, count = refs.len(), "enqueued ready objects");
        if self.graph_obj(graph)?.schedule == ScheduleMode::QueueAuto {
            self.schedule_graph(graph)?;
        }
        Ok(())
    }

    /// Take up to `max` completed objects from graph parameter `index`, oldest first.
    pub fn graph_parameter_dequeue_done_ref(&mut self, graph: Ref, index: usize, max: usize) -> VxResult<Vec<Ref>> {
        let queue = &self.parameter_queue(graph, index)?.queue;
        Ok(std::iter::from_fn(|| queue.dequeue_done()).take(max).collect())
    }

    /// Number of completed objects waiting on graph parameter `index`.
    pub fn graph_parameter_check_done_ref(&self, graph: Ref, index: usize) -> VxResult<usize> {
        Ok(self.parameter_queue(graph, index)?.queue.done_len())
    }

    /// Run passes while every queued parameter has an object available.
    ///
    /// Returns the number of passes run. A graph without queues runs exactly once.
    pub fn schedule_graph(&mut self, graph: Ref) -> VxResult<usize> {
        let queues = self.queued_parameters(graph)?;
        if queues.is_empty() {
            self.process_graph(graph)?;
            return Ok(1);
        }
        let mut passes = 0;
        while queues
            .iter()
            .all(|(_, _, q)| q.ready_len() + q.pending_len() > 0)
        {
            self.process_graph(graph)?;
            passes += 1;
        }
        Ok(passes)
    }

    fn queued_parameters(&self, graph: Ref) -> VxResult<Vec<(Ref, usize, Arc<ExecutionQueue<Ref>>)>> {
        let g = self.graph_obj(graph)?;
        let mut queued = Vec::new();
        for (index, parameter) in g.parameters.iter().enumerate() {
            let Some(q) = &parameter.queue else { continue };
            let node = parameter.node.ok_or_else(|| {
                VxError::InvalidValue(format!("queued graph parameter {index} of {graph} is empty"))
            })?;
            queued.push((node, parameter.index, q.queue.clone()));
        }
        Ok(queued)
    }

    /// Bind the oldest ready object of every queued parameter.
    pub(crate) fn stage_queued_parameters(&mut self, graph: Ref) -> VxResult<()> {
        for (node, slot, queue) in self.queued_parameters(graph)? {
            if queue.ready_len() == 0 {
                queue.move_pending_to_ready();
            }
            let value = queue.peek_ready().ok_or_else(|| {
                VxError::NoResources(format!("no object ready for {node} parameter {slot}"))
            })?;
            self.bind_parameter(node, slot, Some(value), false)?;
        }
        Ok(())
    }

    /// Retire the objects used by the pass that just ran, whether it succeeded or not.
    pub(crate) fn complete_queued_parameters(&mut self, graph: Ref) -> VxResult<()> {
        for (node, slot, queue) in self.queued_parameters(graph)? {
            if !queue.move_ready_to_done() {
                return Err(VxError::NoResources(format!(
                    "done queue full for {node} parameter {slot}"
                )));
            }
            queue.move_pending_to_ready();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::data::{ScalarType, ScalarValue};
    use crate::kernel::{FnKernel, KernelId, ParamDesc, ParamType};
    use crate::target::CpuTarget;

    fn doubler() -> (Context, Ref, Vec<Ref>) {
        let mut ctx = Context::new(ContextConfig::default());
        let kernel = FnKernel::new(
            KernelId(0x20),
            "test.double",
            vec![ParamDesc::bidirectional(ParamType::Scalar(ScalarType::I32))],
            |ctx, params| {
                let value = params[0].ok_or_else(|| VxError::BadParameter("unbound".into()))?;
                let ScalarValue::I32(n) = ctx.read_scalar(value)? else {
                    return Err(VxError::invalid_type("i32", "other"));
                };
                if n < 0 {
                    return Err(VxError::KernelFailed(format!("negative input {n}")));
                }
                ctx.write_scalar(value, ScalarValue::I32(n * 2))
            },
        );
        ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(kernel)))
            .unwrap();
        let kernel = ctx.get_kernel_by_name("test.double").unwrap();
        let graph = ctx.create_graph().unwrap();
        let node = ctx.create_generic_node(graph, kernel).unwrap();
        let param = ctx.get_parameter_by_index(node, 0).unwrap();
        ctx.add_parameter_to_graph(graph, Some(param)).unwrap();
        ctx.release_parameter(param).unwrap();
        let refs: Vec<Ref> = (1..=3)
            .map(|i| ctx.create_scalar(ScalarValue::I32(i)).unwrap())
            .collect();
        (ctx, graph, refs)
    }

    #[test]
    fn manual_schedule_processes_every_enqueued_object() {
        let (mut ctx, graph, refs) = doubler();
        ctx.set_graph_schedule_config(
            graph,
            ScheduleMode::QueueManual,
            &[QueueParams {
                graph_parameter_index: 0,
                refs: refs.clone(),
            }],
        )
        .unwrap();
        ctx.graph_parameter_enqueue_ready_ref(graph, 0, &refs).unwrap();
        assert_eq!(ctx.schedule_graph(graph).unwrap(), 3);
        assert_eq!(ctx.graph_parameter_check_done_ref(graph, 0).unwrap(), 3);
        let done = ctx.graph_parameter_dequeue_done_ref(graph, 0, 8).unwrap();
        assert_eq!(done, refs);
        let values: Vec<ScalarValue> = refs.iter().map(|r| ctx.read_scalar(*r).unwrap()).collect();
        assert_eq!(
            values,
            vec![ScalarValue::I32(2), ScalarValue::I32(4), ScalarValue::I32(6)]
        );
    }

    #[test]
    fn auto_schedule_runs_on_enqueue() {
        let (mut ctx, graph, refs) = doubler();
        ctx.set_graph_schedule_config(
            graph,
            ScheduleMode::QueueAuto,
            &[QueueParams {
                graph_parameter_index: 0,
                refs: refs.clone(),
            }],
        )
        .unwrap();
        ctx.graph_parameter_enqueue_ready_ref(graph, 0, &refs[..1]).unwrap();
        assert_eq!(ctx.read_scalar(refs[0]).unwrap(), ScalarValue::I32(2));
        assert_eq!(ctx.graph_parameter_dequeue_done_ref(graph, 0, 1).unwrap(), vec![refs[0]]);
    }

    #[test]
    fn unregistered_object_is_rejected() {
        let (mut ctx, graph, refs) = doubler();
        ctx.set_graph_schedule_config(
            graph,
            ScheduleMode::QueueManual,
            &[QueueParams {
                graph_parameter_index: 0,
                refs: refs[..2].to_vec(),
            }],
        )
        .unwrap();
        assert!(matches!(
            ctx.graph_parameter_enqueue_ready_ref(graph, 0, &refs[2..]),
            Err(VxError::InvalidValue(_))
        ));
    }

    #[test]
    fn mistyped_queue_object_is_rejected() {
        let (mut ctx, graph, _) = doubler();
        let wrong = ctx.create_scalar(ScalarValue::U8(1)).unwrap();
        assert!(matches!(
            ctx.set_graph_schedule_config(
                graph,
                ScheduleMode::QueueManual,
                &[QueueParams {
                    graph_parameter_index: 0,
                    refs: vec![wrong],
                }],
            ),
            Err(VxError::InvalidType { .. })
        ));
    }

    #[test]
    fn full_queue_rejects_the_whole_batch() {
        let (mut ctx, graph, refs) = doubler();
        ctx.set_graph_schedule_config(
            graph,
            ScheduleMode::QueueManual,
            &[QueueParams {
                graph_parameter_index: 0,
                refs: refs.clone(),
            }],
        )
        .unwrap();
        let queue = ctx.graph_parameter_queue(graph, 0).unwrap();
        while queue.enqueue(refs[0]).is_ok() {
            queue.move_pending_to_ready();
        }
        // Leave exactly one free pending slot behind a full ready stage.
        assert!(queue.move_ready_to_done());
        assert!(queue.move_pending_to_ready());
        let pending = queue.pending_len();
        assert_eq!(pending, queue.depth() - 1);

        assert!(matches!(
            ctx.graph_parameter_enqueue_ready_ref(graph, 0, &refs[1..]),
            Err(VxError::NoResources(_))
        ));
        assert_eq!(queue.pending_len(), pending);
        assert_eq!(queue.ready_len(), queue.depth());
    }

    #[test]
    fn failed_pass_still_retires_its_object() {
        let (mut ctx, graph, refs) = doubler();
        let bad = ctx.create_scalar(ScalarValue::I32(-1)).unwrap();
        ctx.set_graph_schedule_config(
            graph,
            ScheduleMode::QueueManual,
            &[QueueParams {
                graph_parameter_index: 0,
                refs: vec![bad, refs[0]],
            }],
        )
        .unwrap();
        ctx.graph_parameter_enqueue_ready_ref(graph, 0, &[bad, refs[0]])
            .unwrap();

        assert_eq!(
            ctx.schedule_graph(graph),
            Err(VxError::KernelFailed("negative input -1".into()))
        );
        assert_eq!(ctx.graph_parameter_dequeue_done_ref(graph, 0, 4).unwrap(), vec![bad]);

        assert_eq!(ctx.schedule_graph(graph).unwrap(), 1);
        assert_eq!(ctx.read_scalar(refs[0]).unwrap(), ScalarValue::I32(2));
        assert_eq!(ctx.graph_parameter_dequeue_done_ref(graph, 0, 4).unwrap(), vec![refs[0]]);
    }
}
