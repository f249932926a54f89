use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use vxcore::{
    Context, ContextConfig, CpuTarget, ExecutionQueue, FnKernel, KernelId, ParamDesc, ParamType,
    Ref, ScalarType, ScalarValue, VxError,
};

fn context() -> Context {
    let inc = FnKernel::new(
        KernelId(0x800),
        "bench.inc",
        vec![
            ParamDesc::input(ParamType::Scalar(ScalarType::U32)),
            ParamDesc::output(ParamType::Scalar(ScalarType::U32)),
        ],
        |ctx, params| {
            let [Some(input), Some(output)] = params else {
                return Err(VxError::BadParameter("unbound".into()));
            };
            let ScalarValue::U32(v) = ctx.read_scalar(*input)? else {
                return Err(VxError::KernelFailed("expected u32".into()));
            };
            ctx.write_scalar(*output, ScalarValue::U32(v.wrapping_add(1)))
        },
    );
    let mut ctx = Context::new(ContextConfig::default().with_perf(false));
    ctx.load_target(Arc::new(CpuTarget::new("cpu").with_kernel(inc)))
        .unwrap();
    ctx
}

fn chain(ctx: &mut Context, len: usize) -> Ref {
    let graph = ctx.create_graph().unwrap();
    let kernel = ctx.get_kernel_by_name("bench.inc").unwrap();
    let mut prev = ctx.create_scalar(ScalarValue::U32(0)).unwrap();
    for _ in 0..len {
        let next = ctx.create_scalar(ScalarValue::U32(0)).unwrap();
        let node = ctx
            .create_node_with_parameters(graph, kernel, &[Some(prev), Some(next)])
            .unwrap();
        ctx.release_node(node).unwrap();
        prev = next;
    }
    ctx.release_kernel(kernel).unwrap();
    graph
}

fn bench_process_chain(c: &mut Criterion) {
    let mut ctx = context();
    let graph = chain(&mut ctx, 16);
    ctx.verify_graph(graph).unwrap();

    c.bench_function("process_chain_16", |b| {
        b.iter(|| {
            ctx.process_graph(black_box(graph)).unwrap();
        })
    });
}

fn bench_verify_chain(c: &mut Criterion) {
    let mut ctx = context();
    let graph = chain(&mut ctx, 64);

    c.bench_function("verify_chain_64", |b| {
        b.iter(|| {
            ctx.verify_graph(black_box(graph)).unwrap();
        })
    });
}

fn bench_queue_cycle(c: &mut Criterion) {
    let queue = ExecutionQueue::new(64);

    c.bench_function("queue_cycle_64", |b| {
        b.iter(|| {
            for i in 0..64u32 {
                queue.enqueue(i).unwrap();
                queue.move_pending_to_ready();
                queue.move_ready_to_done();
            }
            black_box(queue.drain_done());
        })
    });
}

criterion_group!(benches, bench_process_chain, bench_verify_chain, bench_queue_cycle);
criterion_main!(benches);
