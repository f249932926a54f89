//! Delays bound to node parameters and aged between passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vxcore::{
    Context, ContextConfig, CpuTarget, FnKernel, KernelId, ParamDesc, ParamType, Ref, ScalarType,
    ScalarValue, VxError,
};

const U8: ParamType = ParamType::Scalar(ScalarType::U8);

/// Route engine logs through the test harness's captured output.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init()
        .ok();
}

struct Fixture {
    ctx: Context,
    graph: Ref,
    node: Ref,
    delay: Ref,
    fail: Arc<AtomicBool>,
}

/// One node computing `delay[0] = delay[-1] + 1`, aged after every pass.
fn counter(slots: usize) -> Fixture {
    init_tracing();
    let fail = Arc::new(AtomicBool::new(false));
    let step = {
        let fail = fail.clone();
        FnKernel::new(
            KernelId(0x500),
            "test.step",
            vec![ParamDesc::input(U8), ParamDesc::output(U8)],
            move |ctx, params| {
                if fail.load(Ordering::SeqCst) {
                    return Err(VxError::KernelFailed("step refused".into()));
                }
                let [Some(prev), Some(cur)] = params else {
                    return Err(VxError::BadParameter("unbound".into()));
                };
                let ScalarValue::U8(v) = ctx.read_scalar(*prev)? else {
                    return Err(VxError::KernelFailed("expected u8".into()));
                };
                ctx.write_scalar(*cur, ScalarValue::U8(v + 1))
            },
        )
    };
    let mut ctx = Context::new(ContextConfig::default());
    ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(step)))
        .unwrap();

    let exemplar = ctx.create_scalar(ScalarValue::U8(0)).unwrap();
    let delay = ctx.create_delay(exemplar, slots).unwrap();
    ctx.release_reference(exemplar).unwrap();

    let graph = ctx.create_graph().unwrap();
    let prev = ctx.get_delay_reference(delay, -1).unwrap();
    let cur = ctx.get_delay_reference(delay, 0).unwrap();
    let kernel = ctx.get_kernel_by_name("test.step").unwrap();
    let node = ctx
        .create_node_with_parameters(graph, kernel, &[Some(prev), Some(cur)])
        .unwrap();
    ctx.release_kernel(kernel).unwrap();
    ctx.register_auto_aging(graph, delay).unwrap();

    Fixture {
        ctx,
        graph,
        node,
        delay,
        fail,
    }
}

fn newest(ctx: &Context, delay: Ref) -> ScalarValue {
    let r = ctx.get_delay_reference(delay, -1).unwrap();
    ctx.read_scalar(r).unwrap()
}

#[test]
fn auto_aging_feeds_each_pass_the_previous_result() {
    let mut f = counter(2);
    for pass in 1..=5u8 {
        f.ctx.process_graph(f.graph).unwrap();
        assert_eq!(newest(&f.ctx, f.delay), ScalarValue::U8(pass));
    }
    assert!(f.ctx.is_graph_verified(f.graph).unwrap());
}

#[test]
fn parameters_follow_the_rotation() {
    let mut f = counter(3);
    f.ctx.process_graph(f.graph).unwrap();
    assert_eq!(
        f.ctx.node_parameter(f.node, 0).unwrap(),
        Some(f.ctx.get_delay_reference(f.delay, -1).unwrap())
    );
    assert_eq!(
        f.ctx.node_parameter(f.node, 1).unwrap(),
        Some(f.ctx.get_delay_reference(f.delay, 0).unwrap())
    );
}

#[test]
fn failed_pass_does_not_age() {
    let mut f = counter(2);
    f.ctx.process_graph(f.graph).unwrap();
    let before = f.ctx.get_delay_reference(f.delay, 0).unwrap();

    f.fail.store(true, Ordering::SeqCst);
    assert!(f.ctx.process_graph(f.graph).is_err());
    assert_eq!(f.ctx.get_delay_reference(f.delay, 0).unwrap(), before);

    f.fail.store(false, Ordering::SeqCst);
    f.ctx.process_graph(f.graph).unwrap();
    assert_eq!(newest(&f.ctx, f.delay), ScalarValue::U8(2));
}

#[test]
fn rebinding_away_from_a_delay_stops_rotation() {
    let mut f = counter(2);
    let fixed = f.ctx.create_scalar(ScalarValue::U8(40)).unwrap();
    f.ctx.set_parameter_by_index(f.node, 0, Some(fixed)).unwrap();

    f.ctx.process_graph(f.graph).unwrap();
    f.ctx.process_graph(f.graph).unwrap();

    assert_eq!(f.ctx.node_parameter(f.node, 0).unwrap(), Some(fixed));
    assert_eq!(newest(&f.ctx, f.delay), ScalarValue::U8(41));
}

#[test]
fn graph_keeps_registered_delay_alive() {
    let mut f = counter(2);
    f.ctx.release_delay(f.delay).unwrap();
    f.ctx.process_graph(f.graph).unwrap();
    assert_eq!(newest(&f.ctx, f.delay), ScalarValue::U8(1));

    f.ctx.release_node(f.node).unwrap();
    f.ctx.release_graph(f.graph).unwrap();
    assert!(!f.ctx.is_valid_reference(f.delay, None));
    // Only the target and its kernel remain.
    assert_eq!(f.ctx.live_references(), 2);
}
