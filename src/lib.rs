//! Dataflow graph engine for vision and signal kernels.
//!
//! A [`Context`] owns every entity: graphs, nodes, kernels, targets, delays and data
//! objects. Hosts build graphs by creating nodes and binding data objects to their
//! parameters, verify them once, and then execute them repeatedly. Kernels are
//! provided by pluggable [`Target`] backends.

pub mod builder;
pub mod config;
pub mod context;
pub mod data;
pub mod delay;
pub mod dispatch;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod kernel;
pub mod node;
pub mod parameter;
pub mod perf;
pub mod pipeline;
pub mod queue;
pub mod reference;
pub mod target;
mod topology;

pub use builder::GraphBuilder;
pub use config::ContextConfig;
pub use context::Context;
pub use data::{Buffer, DataObject, ObjectArray, Pyramid, Scalar, ScalarType, ScalarValue};
pub use dispatch::Action;
pub use error::{VxError, VxResult};
pub use graph::GraphState;
pub use kernel::{
    BorderMode, Direction, ExecContext, FnKernel, KernelAttributes, KernelDef, KernelDefDyn,
    KernelId, ParamDesc, ParamState, ParamType, ValidateContext,
};
pub use node::{NodeCallback, NodeStatus};
pub use perf::Perf;
pub use pipeline::{QueueParams, ScheduleMode};
pub use queue::{ExecutionQueue, RingBuffer};
pub use reference::{Counter, Ref, RefType};
pub use target::{CpuTarget, Target, TargetSelect};
